//! Socket-like stream over one USB bulk endpoint pair
//!
//! [`UsbDataLink`] gives callers a blocking stream API (connect, bind, read,
//! write, flush, shutdown, close) on top of asynchronous bulk transfers.
//! All state lives behind one mutex shared with the transfer completion
//! handlers. Three condition variables let callers wait without holding it:
//!
//! - `flushed`: output buffer became empty
//! - `accepted`: the connect handshake was decided
//! - `drained`: no transfer is outstanding

use crate::buffer::{OutputBuffer, StreamBuffer};
use crate::config::LinkConfig;
use crate::driver::UsbDriver;
use crate::error::{ConnectError, LinkError, Result};
use crate::events::{EventSink, LinkEvent, LinkId, Notification};
use crate::scheduler::Scheduler;
use crate::state::{Channels, LinkState};
use common::UsbAddress;
use protocol::{FrameKind, HandshakeToken};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Which side of the handshake an open performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `connect`: send the connect token and wait for the answer
    Active,
    /// `bind`: connected at once, no wire traffic
    Passive,
}

/// A bidirectional byte stream over a USB device
///
/// # Example
/// ```no_run
/// use common::UsbAddress;
/// use link::{LinkConfig, NullSink, RusbDriver, UsbDataLink};
/// use std::sync::Arc;
///
/// let config = LinkConfig::default();
/// let driver = Arc::new(RusbDriver::new(config.poll_interval()).unwrap());
/// let link = UsbDataLink::new(driver, config, Arc::new(NullSink)).unwrap();
///
/// let address: UsbAddress = "04f9:0042".parse().unwrap();
/// link.connect(&address).unwrap();
/// link.write(b"hello");
/// link.flush();
/// link.close();
/// ```
pub struct UsbDataLink<D: UsbDriver> {
    shared: Arc<Shared<D>>,
}

/// State shared between the public API and completion handlers
pub(crate) struct Shared<D: UsbDriver> {
    pub(crate) id: LinkId,
    pub(crate) config: LinkConfig,
    events: Arc<dyn EventSink>,
    inner: Mutex<Inner<D>>,
    pub(crate) flushed: Condvar,
    pub(crate) accepted: Condvar,
    pub(crate) drained: Condvar,
}

/// Everything guarded by the link mutex
pub(crate) struct Inner<D: UsbDriver> {
    pub(crate) phase: LinkState,
    pub(crate) input: StreamBuffer,
    pub(crate) output: OutputBuffer,
    pub(crate) scheduler: Scheduler<D>,
}

impl<D: UsbDriver> UsbDataLink<D> {
    /// Create an idle link
    pub fn new(driver: Arc<D>, config: LinkConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;

        let scheduler = Scheduler::new(driver, config.scratch_capacity, config.transfer_timeout());
        let id = LinkId::next();
        debug!("{} created ({} byte transfers)", id, config.scratch_capacity);

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                events,
                inner: Mutex::new(Inner {
                    phase: LinkState::Idle,
                    input: StreamBuffer::new(),
                    output: OutputBuffer::new(),
                    scheduler,
                }),
                flushed: Condvar::new(),
                accepted: Condvar::new(),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_accepted(&self) -> bool {
        self.state().is_accepted()
    }

    /// Open `address` and perform the client handshake
    ///
    /// Any previous connection is closed first. Blocks until the peer answers
    /// the connect token (or the configured handshake timeout passes). On
    /// failure every acquired resource is released before returning.
    pub fn connect(&self, address: &UsbAddress) -> Result<()> {
        self.close();
        self.shared.open(address, Role::Active)?;
        info!("{} connecting to {}", self.shared.id, address);

        self.write(HandshakeToken::Connect.as_bytes());

        let timeout = self.shared.config.handshake_timeout();
        let guard = self.shared.lock();
        let (guard, timed_out) = match timeout {
            Some(timeout) => {
                let (guard, result) = self
                    .shared
                    .accepted
                    .wait_timeout_while(guard, timeout, |inner| !inner.phase.is_accepted())
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, result.timed_out())
            }
            None => {
                let guard = self
                    .shared
                    .accepted
                    .wait_while(guard, |inner| !inner.phase.is_accepted())
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
        };

        let failure = match guard.phase {
            LinkState::Connected(_) => {
                info!("{} connected to {}", self.shared.id, address);
                self.shared.emit(LinkEvent::Connected);
                return Ok(());
            }
            LinkState::Connecting(_) if timed_out => {
                ConnectError::HandshakeTimeout(timeout.unwrap_or_default())
            }
            LinkState::Rejected => ConnectError::Rejected,
            _ => ConnectError::Aborted,
        };
        drop(guard);

        warn!("{} connect to {} failed: {}", self.shared.id, address, failure);
        self.close();
        Err(failure.into())
    }

    /// Open `address` as the passive side: connected at once, nothing sent
    pub fn bind(&self, address: &UsbAddress) -> Result<()> {
        self.shared.open(address, Role::Passive)?;
        info!("{} bound to {}", self.shared.id, address);
        Ok(())
    }

    /// Tear the link down; safe to call in any state and more than once
    ///
    /// A connected link first sends a disconnect frame and waits for it to
    /// reach the device. Outstanding transfers are cancelled and waited for
    /// before the device is released.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Move up to `buf.len()` bytes of input into `buf`
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let n = inner.input.read_into(buf);
        if n > 0 {
            self.shared.settle(inner);
        }
        n
    }

    /// Drop up to `n` bytes of input without copying them
    pub fn discard(&self, n: usize) -> usize {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let n = inner.input.pop(n);
        if n > 0 {
            self.shared.settle(inner);
        }
        n
    }

    /// Queue `data` for sending
    ///
    /// Never fails synchronously: when output is closed the data is dropped
    /// and [`LinkEvent::OutputError`] is emitted.
    pub fn write(&self, data: &[u8]) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;

        if !inner.phase.accepts_writes() {
            debug!(
                "{} dropping {} byte write while {}",
                self.shared.id,
                data.len(),
                inner.phase
            );
            self.shared.emit(LinkEvent::OutputError);
            return;
        }
        if data.is_empty() {
            return;
        }

        for chunk in data.chunks(self.shared.config.max_frame_payload()) {
            if let Err(e) = inner.output.push_frame(FrameKind::Normal, chunk) {
                warn!("{} dropping unframeable write: {}", self.shared.id, e);
                self.shared.emit(LinkEvent::OutputError);
                break;
            }
        }
        self.shared.schedule_write(inner);
    }

    /// Block until all queued output has been acknowledged by the device
    pub fn flush(&self) {
        let guard = self.shared.lock();
        let _guard = self
            .shared
            .flushed
            .wait_while(guard, |inner| !inner.output.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Stop accepting input and drop what is buffered
    pub fn shutdown_input(&self) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if self.shared.close_input(inner, true) {
            debug!("{} input shut down", self.shared.id);
            self.shared.emit(LinkEvent::InputShutdown);
            self.shared.settle(inner);
        }
    }

    /// Stop sending and drop queued output
    pub fn shutdown_output(&self) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if self.shared.close_output(inner) {
            debug!("{} output shut down", self.shared.id);
            self.shared.emit(LinkEvent::OutputShutdown);
            self.shared.settle(inner);
        }
    }

    /// Whether input is waiting to be read
    pub fn is_ready(&self) -> bool {
        !self.shared.lock().input.is_empty()
    }

    /// Bytes of input waiting to be read
    pub fn size(&self) -> usize {
        self.shared.lock().input.len()
    }

    /// Framed bytes queued for sending, including any write in flight
    pub fn pending_output(&self) -> usize {
        self.shared.lock().output.len()
    }

    /// Answer a peer's connect token from the passive side
    pub fn reply_handshake(&self, accept: bool) {
        let token = if accept {
            HandshakeToken::Accept
        } else {
            HandshakeToken::Reject
        };
        debug!("{} answering handshake with {:?}", self.shared.id, token);
        self.write(token.as_bytes());
    }
}

impl<D: UsbDriver> Drop for UsbDataLink<D> {
    fn drop(&mut self) {
        // No disconnect frame on drop: nobody is left to wait for the flush
        {
            let mut guard = self.shared.lock();
            self.shared.close_output(&mut guard);
        }
        self.shared.close();
    }
}

impl<D: UsbDriver> Shared<D> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        self.events.emit(Notification {
            link: self.id,
            event,
        });
    }

    fn open(self: &Arc<Self>, address: &UsbAddress, role: Role) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.phase.holds_device() {
            return Err(LinkError::AlreadyOpen);
        }

        inner.scheduler.open(address).inspect_err(|e| {
            warn!("{} failed to open {}: {}", self.id, address, e);
        })?;

        inner.input.clear();
        inner.output.clear();
        inner.phase = match role {
            Role::Active => LinkState::Connecting(Channels::OPEN),
            Role::Passive => LinkState::Connected(Channels::OPEN),
        };

        if let Err(e) = self.submit_read(inner) {
            warn!("{} failed to prime read on {}: {}", self.id, address, e);
            inner.phase = LinkState::Closed;
            inner.scheduler.release();
            return Err(ConnectError::Submit(e).into());
        }

        Ok(())
    }

    fn close(self: &Arc<Self>) {
        let mut guard = self.lock();
        let was_connected = guard.phase.is_connected();

        if was_connected && guard.phase.output_open() {
            let inner = &mut *guard;
            let in_flight = inner.scheduler.write_in_flight_len();
            inner.output.retain_front(in_flight);
            if let Err(e) = inner.output.push_frame(FrameKind::Disconnect, &[]) {
                warn!("{} failed to frame disconnect: {}", self.id, e);
            }
            if let Some(channels) = inner.phase.channels() {
                inner.phase = LinkState::Closing(channels);
            }
            self.schedule_write(inner);

            debug!("{} waiting for disconnect frame to flush", self.id);
            guard = self
                .flushed
                .wait_while(guard, |inner| !inner.output.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
        }

        if was_connected {
            info!("{} disconnected", self.id);
            self.emit(LinkEvent::Disconnected);
        }

        if !guard.phase.holds_device() {
            return;
        }

        {
            let inner = &mut *guard;
            inner.phase = LinkState::Closing(Channels::CLOSED);
            inner.input.clear();
            inner.output.clear();
            inner.scheduler.cancel_all();
        }
        self.flushed.notify_all();
        self.accepted.notify_all();

        guard = self
            .drained
            .wait_while(guard, |inner| inner.scheduler.active() > 0)
            .unwrap_or_else(PoisonError::into_inner);

        guard.scheduler.release();
        guard.phase = LinkState::Closed;
        self.flushed.notify_all();
        self.accepted.notify_all();
        debug!("{} closed", self.id);
    }

    /// Mark input closed; returns whether it was open
    pub(crate) fn close_input(&self, inner: &mut Inner<D>, discard: bool) -> bool {
        let Some(channels) = inner.phase.channels_mut() else {
            return false;
        };
        if !channels.readable {
            return false;
        }
        channels.readable = false;
        if discard {
            inner.input.clear();
        }
        true
    }

    /// Mark output closed and drop queued output; returns whether it was open
    pub(crate) fn close_output(&self, inner: &mut Inner<D>) -> bool {
        let Some(channels) = inner.phase.channels_mut() else {
            return false;
        };
        if !channels.writable {
            return false;
        }
        channels.writable = false;
        inner.output.clear();
        self.flushed.notify_all();
        true
    }

    /// Apply the phase consequences of closed directions
    ///
    /// A connected link with both directions closed and nothing left to read
    /// becomes disconnected. A handshake that can no longer complete is
    /// rejected.
    pub(crate) fn settle(&self, inner: &mut Inner<D>) {
        match inner.phase {
            LinkState::Connected(channels)
                if !channels.readable && !channels.writable && inner.input.is_empty() =>
            {
                inner.phase = LinkState::Disconnected;
                info!("{} disconnected", self.id);
                self.emit(LinkEvent::Disconnected);
            }
            LinkState::Connecting(channels) if !channels.readable || !channels.writable => {
                warn!("{} handshake cannot complete", self.id);
                inner.phase = LinkState::Rejected;
                inner.output.clear();
                self.flushed.notify_all();
                self.accepted.notify_all();
            }
            _ => {}
        }
    }

    /// Close both directions and cancel transfers after device loss or a
    /// protocol violation; resources are freed by `close`
    ///
    /// Unread input is dropped even when input was already closed, so a
    /// connected link always ends up disconnected.
    pub(crate) fn fail_link(&self, inner: &mut Inner<D>) {
        if self.close_input(inner, true) {
            self.emit(LinkEvent::InputShutdown);
        }
        inner.input.clear();
        if self.close_output(inner) {
            self.emit(LinkEvent::OutputShutdown);
        }
        inner.scheduler.cancel_all();
        self.settle(inner);
    }
}
