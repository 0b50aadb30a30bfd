//! Transfer scheduling and completion handling
//!
//! A link owns exactly one read transfer and one write transfer. Each has a
//! scratch buffer that is moved into the driver while the transfer is in
//! flight and comes back with the completion. Every submission bumps the
//! active counter and every completion (cancelled and failed ones included)
//! drops it; `close` waits for the counter to reach zero before anything is
//! freed.
//!
//! Completion handlers run on the driver's thread. They take the link lock,
//! update buffers and phase, emit notifications and resubmit, but never block.

use crate::driver::{BulkRequest, Completion, CompletionHandler, TransferStatus, UsbDriver};
use crate::error::{ConnectError, DriverError};
use crate::events::LinkEvent;
use crate::link::{Inner, Shared};
use crate::state::LinkState;
use common::UsbAddress;
use protocol::{FrameKind, HandshakeToken, decode_frames};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    In,
    Out,
}

struct TransferSlot<T> {
    transfer: Option<T>,
    scratch: Vec<u8>,
    /// Submitted length while a transfer is outstanding
    in_flight: Option<usize>,
}

impl<T> TransferSlot<T> {
    fn empty() -> Self {
        Self {
            transfer: None,
            scratch: Vec::new(),
            in_flight: None,
        }
    }
}

/// Device and transfer resources of one link
pub(crate) struct Scheduler<D: UsbDriver> {
    driver: Arc<D>,
    device: Option<D::Device>,
    address: Option<UsbAddress>,
    read: TransferSlot<D::Transfer>,
    write: TransferSlot<D::Transfer>,
    active: usize,
    capacity: usize,
    timeout: Option<Duration>,
}

impl<D: UsbDriver> Scheduler<D> {
    pub(crate) fn new(driver: Arc<D>, capacity: usize, timeout: Option<Duration>) -> Self {
        Self {
            driver,
            device: None,
            address: None,
            read: TransferSlot::empty(),
            write: TransferSlot::empty(),
            active: 0,
            capacity,
            timeout,
        }
    }

    /// Open the device and allocate both transfers, releasing whatever was
    /// acquired if a later step fails
    pub(crate) fn open(&mut self, address: &UsbAddress) -> Result<(), ConnectError> {
        let device = self
            .driver
            .open(address)
            .map_err(ConnectError::DeviceOpen)?;

        let read = match self.driver.alloc_transfer() {
            Ok(transfer) => transfer,
            Err(e) => {
                self.driver.close(device, address.interface);
                return Err(ConnectError::Allocation(e));
            }
        };

        let write = match self.driver.alloc_transfer() {
            Ok(transfer) => transfer,
            Err(e) => {
                self.driver.free_transfer(read);
                self.driver.close(device, address.interface);
                return Err(ConnectError::Allocation(e));
            }
        };

        self.device = Some(device);
        self.address = Some(*address);
        self.read = TransferSlot {
            transfer: Some(read),
            scratch: vec![0; self.capacity],
            in_flight: None,
        };
        self.write = TransferSlot {
            transfer: Some(write),
            scratch: vec![0; self.capacity],
            in_flight: None,
        };
        Ok(())
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }

    pub(crate) fn write_in_flight(&self) -> bool {
        self.write.in_flight.is_some()
    }

    /// Bytes of output carried by the outstanding write, zero when idle
    pub(crate) fn write_in_flight_len(&self) -> usize {
        self.write.in_flight.unwrap_or(0)
    }

    pub(crate) fn submit_read(&mut self, on_complete: CompletionHandler) -> Result<(), DriverError> {
        self.submit(Direction::In, &[], on_complete)
    }

    /// Submit `data` as one write; `data` never exceeds the scratch capacity
    pub(crate) fn submit_write(
        &mut self,
        data: &[u8],
        on_complete: CompletionHandler,
    ) -> Result<(), DriverError> {
        self.submit(Direction::Out, data, on_complete)
    }

    fn submit(
        &mut self,
        direction: Direction,
        data: &[u8],
        on_complete: CompletionHandler,
    ) -> Result<(), DriverError> {
        let (Some(device), Some(address)) = (self.device.as_ref(), self.address) else {
            return Err(DriverError::NoDevice);
        };
        let capacity = self.capacity;
        let (slot, endpoint) = match direction {
            Direction::In => (&mut self.read, address.bulk_in),
            Direction::Out => (&mut self.write, address.bulk_out),
        };
        let Some(transfer) = slot.transfer.as_ref() else {
            return Err(DriverError::Other("transfer not allocated".to_string()));
        };
        if slot.in_flight.is_some() {
            return Err(DriverError::Busy);
        }

        let mut buffer = std::mem::take(&mut slot.scratch);
        buffer.resize(capacity, 0);
        let length = match direction {
            Direction::In => capacity,
            Direction::Out => {
                buffer[..data.len()].copy_from_slice(data);
                data.len()
            }
        };

        self.active += 1;
        slot.in_flight = Some(length);

        let request = BulkRequest {
            endpoint,
            buffer,
            length,
            timeout: self.timeout,
        };

        match self
            .driver
            .submit_bulk(transfer, device, request, on_complete)
        {
            Ok(()) => {
                trace!(
                    "Submitted {:?} transfer on {:#04x}: {} bytes",
                    direction, endpoint, length
                );
                Ok(())
            }
            Err(e) => {
                self.active -= 1;
                slot.in_flight = None;
                slot.scratch = e.buffer;
                Err(e.error)
            }
        }
    }

    /// Record a completion: drop the active count and clear the in-flight
    /// mark. Returns the submitted length.
    pub(crate) fn complete(&mut self, direction: Direction) -> usize {
        match self.active.checked_sub(1) {
            Some(active) => self.active = active,
            None => warn!("{:?} completion without an outstanding transfer", direction),
        }
        self.slot_mut(direction).in_flight.take().unwrap_or(0)
    }

    /// Take a scratch buffer back from a completion
    pub(crate) fn recycle(&mut self, direction: Direction, buffer: Vec<u8>) {
        self.slot_mut(direction).scratch = buffer;
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut TransferSlot<D::Transfer> {
        match direction {
            Direction::In => &mut self.read,
            Direction::Out => &mut self.write,
        }
    }

    /// Ask the driver to cancel whatever is outstanding; never blocks
    pub(crate) fn cancel_all(&self) {
        for slot in [&self.read, &self.write] {
            if slot.in_flight.is_some()
                && let Some(transfer) = &slot.transfer
            {
                self.driver.cancel(transfer);
            }
        }
    }

    /// Free both transfers and close the device
    ///
    /// Only valid once nothing is outstanding.
    pub(crate) fn release(&mut self) {
        if self.active > 0 {
            warn!(
                "Releasing transfers with {} still outstanding",
                self.active
            );
        }
        for slot in [&mut self.read, &mut self.write] {
            if let Some(transfer) = slot.transfer.take() {
                self.driver.free_transfer(transfer);
            }
            slot.scratch = Vec::new();
            slot.in_flight = None;
        }
        if let (Some(device), Some(address)) = (self.device.take(), self.address.take()) {
            self.driver.close(device, address.interface);
        }
    }
}

impl<D: UsbDriver> Shared<D> {
    fn read_handler(self: &Arc<Self>) -> CompletionHandler {
        let shared = Arc::clone(self);
        Box::new(move |completion| shared.on_read_complete(completion))
    }

    fn write_handler(self: &Arc<Self>) -> CompletionHandler {
        let shared = Arc::clone(self);
        Box::new(move |completion| shared.on_write_complete(completion))
    }

    /// Prime the read side
    pub(crate) fn submit_read(self: &Arc<Self>, inner: &mut Inner<D>) -> Result<(), DriverError> {
        inner.scheduler.submit_read(self.read_handler())
    }

    /// Resubmit a read, losing the input direction if the driver refuses
    fn schedule_read(self: &Arc<Self>, inner: &mut Inner<D>) {
        if let Err(e) = self.submit_read(inner) {
            warn!("{} failed to resubmit read: {}", self.id, e);
            if self.close_input(inner, false) {
                self.emit(LinkEvent::InputShutdown);
            }
            self.settle(inner);
        }
    }

    /// Push the next run of whole frames unless a write is already outstanding
    pub(crate) fn schedule_write(self: &Arc<Self>, inner: &mut Inner<D>) {
        if inner.scheduler.write_in_flight() || !inner.phase.output_open() {
            return;
        }
        let length = inner.output.next_chunk_len(self.config.scratch_capacity);
        if length == 0 {
            return;
        }

        let handler = self.write_handler();
        if let Err(e) = inner
            .scheduler
            .submit_write(inner.output.peek(length), handler)
        {
            warn!("{} failed to submit write: {}", self.id, e);
            self.output_failed(inner);
        }
    }

    pub(crate) fn on_read_complete(self: &Arc<Self>, completion: Completion) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        inner.scheduler.complete(Direction::In);
        let Completion {
            status,
            buffer,
            actual_length,
        } = completion;

        if !inner.phase.input_open() {
            inner.scheduler.recycle(Direction::In, buffer);
            self.notify_if_drained(inner);
            return;
        }

        match status {
            TransferStatus::Completed | TransferStatus::TimedOut => {
                let data = &buffer[..actual_length.min(buffer.len())];
                if !data.is_empty() {
                    debug!("{} received {} bytes", self.id, data.len());
                }
                self.absorb(inner, data);
                inner.scheduler.recycle(Direction::In, buffer);
                if inner.phase.input_open() {
                    self.schedule_read(inner);
                }
            }
            TransferStatus::Cancelled => {
                debug!("{} read cancelled", self.id);
                inner.scheduler.recycle(Direction::In, buffer);
            }
            TransferStatus::NoDevice
            | TransferStatus::Stall
            | TransferStatus::Overflow
            | TransferStatus::Error => {
                warn!("{} read failed: {:?}", self.id, status);
                inner.scheduler.recycle(Direction::In, buffer);
                if self.close_input(inner, false) {
                    self.emit(LinkEvent::InputShutdown);
                }
                self.settle(inner);
            }
        }

        self.notify_if_drained(inner);
    }

    pub(crate) fn on_write_complete(self: &Arc<Self>, completion: Completion) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let submitted = inner.scheduler.complete(Direction::Out);
        inner.scheduler.recycle(Direction::Out, completion.buffer);

        if !inner.phase.output_open() {
            self.notify_if_drained(inner);
            return;
        }

        match completion.status {
            TransferStatus::Completed if completion.actual_length == submitted => {
                if !inner.output.consume(submitted) {
                    warn!("{} acknowledged write does not end on a frame", self.id);
                    self.output_failed(inner);
                } else if inner.output.is_empty() {
                    debug!("{} output flushed", self.id);
                    self.flushed.notify_all();
                    self.emit(LinkEvent::OutputFlushed);
                } else {
                    self.schedule_write(inner);
                }
            }
            TransferStatus::Completed => {
                warn!(
                    "{} short write: {} of {} bytes",
                    self.id, completion.actual_length, submitted
                );
                self.output_failed(inner);
            }
            TransferStatus::Cancelled => {
                debug!("{} write cancelled", self.id);
            }
            TransferStatus::NoDevice => {
                warn!("{} device removed during write", self.id);
                self.fail_link(inner);
            }
            TransferStatus::TimedOut
            | TransferStatus::Stall
            | TransferStatus::Overflow
            | TransferStatus::Error => {
                warn!("{} write failed: {:?}", self.id, completion.status);
                self.output_failed(inner);
            }
        }

        self.notify_if_drained(inner);
    }

    /// Decode one transfer's worth of frames into the input buffer
    fn absorb(&self, inner: &mut Inner<D>, data: &[u8]) {
        let was_empty = inner.input.is_empty();
        let mut frames = decode_frames(data);

        for frame in frames.by_ref() {
            if !inner.phase.input_open() {
                break;
            }

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("{} protocol violation: {}; tearing down", self.id, e);
                    self.fail_link(inner);
                    return;
                }
            };

            trace!(
                "{} frame {:?} ({} bytes)",
                self.id,
                frame.kind,
                frame.payload.len()
            );

            match frame.kind {
                FrameKind::Normal if matches!(inner.phase, LinkState::Connecting(_)) => {
                    if !frame.payload.is_empty() {
                        self.resolve_handshake(inner, frame.payload);
                    }
                }
                FrameKind::Normal => inner.input.write(frame.payload),
                FrameKind::Disconnect => {
                    info!("{} peer closed its output", self.id);
                    if self.close_input(inner, false) {
                        self.emit(LinkEvent::InputShutdown);
                    }
                    break;
                }
            }
        }

        if frames.remaining() > 0 && !inner.phase.input_open() {
            debug!(
                "{} ignoring {} bytes after input closed",
                self.id,
                frames.remaining()
            );
        }

        if was_empty && !inner.input.is_empty() {
            self.emit(LinkEvent::InputReady);
        }
        self.settle(inner);
    }

    /// The first non-empty payload after `connect` is the peer's answer
    fn resolve_handshake(&self, inner: &mut Inner<D>, payload: &[u8]) {
        let LinkState::Connecting(channels) = inner.phase else {
            return;
        };

        if HandshakeToken::parse(payload) == Some(HandshakeToken::Accept) {
            debug!("{} handshake accepted", self.id);
            inner.phase = LinkState::Connected(channels);
        } else {
            warn!(
                "{} handshake refused ({} byte answer)",
                self.id,
                payload.len()
            );
            inner.phase = LinkState::Rejected;
            inner.output.clear();
            self.flushed.notify_all();
        }
        self.accepted.notify_all();
    }

    /// A write transfer failed: report it and stop sending
    fn output_failed(&self, inner: &mut Inner<D>) {
        self.emit(LinkEvent::OutputError);
        if self.close_output(inner) {
            self.emit(LinkEvent::OutputShutdown);
        }
        self.settle(inner);
    }

    fn notify_if_drained(&self, inner: &Inner<D>) {
        if inner.scheduler.active() == 0 {
            self.drained.notify_all();
        }
    }
}
