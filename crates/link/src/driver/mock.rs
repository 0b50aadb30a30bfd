//! In-memory driver for tests and loopback experiments
//!
//! Nothing completes on its own: submitted transfers stay pending until the
//! owner calls [`MockDriver::complete_read`], [`MockDriver::complete_write`]
//! or one of the failure helpers. Completion handlers always run on the
//! calling thread with the mock's own lock released.
//!
//! Cancellation is delivered from a helper thread by default. With
//! [`MockDriver::defer_cancellation`] enabled, cancelled transfers are parked
//! until [`MockDriver::deliver_cancellations`] is called, which lets tests
//! observe a close that is still waiting for outstanding transfers.

use super::{
    BulkRequest, Completion, CompletionHandler, SubmitError, TransferStatus, UsbDriver,
    is_in_endpoint,
};
use crate::error::DriverError;
use bytes::BytesMut;
use common::UsbAddress;
use protocol::{FrameKind, decode_frames, encode_frame};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// Handle to a device opened through the mock
#[derive(Debug)]
pub struct MockDevice {
    address: UsbAddress,
}

impl MockDevice {
    pub fn address(&self) -> &UsbAddress {
        &self.address
    }
}

/// Transfer slot allocated by the mock
#[derive(Debug)]
pub struct MockTransfer {
    id: u64,
}

struct Pending {
    transfer: u64,
    request: BulkRequest,
    on_complete: CompletionHandler,
}

#[derive(Default)]
struct MockState {
    open_error: Option<DriverError>,
    /// Fail the allocation once this many transfers are live
    alloc_limit: Option<usize>,
    submit_error: Option<DriverError>,
    deferred_cancel: bool,

    open_devices: usize,
    opens: usize,
    closes: usize,
    allocated: usize,
    freed: usize,
    next_transfer: u64,
    submitted_reads: usize,
    submitted_writes: usize,

    pending: Vec<Pending>,
    cancelled: Vec<Pending>,
    written: Vec<Vec<u8>>,
}

impl MockState {
    fn take_pending(&mut self, direction_in: bool) -> Option<Pending> {
        let index = self
            .pending
            .iter()
            .position(|p| is_in_endpoint(p.request.endpoint) == direction_in)?;
        Some(self.pending.remove(index))
    }

    fn has_pending(&self, direction_in: bool) -> bool {
        self.pending
            .iter()
            .any(|p| is_in_endpoint(p.request.endpoint) == direction_in)
    }
}

/// Scriptable in-memory driver
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- scripting ----

    /// Make every subsequent `open` fail with `error`
    pub fn fail_open(&self, error: DriverError) {
        self.lock().open_error = Some(error);
    }

    /// Refuse allocations once `live` transfers exist
    pub fn limit_allocations(&self, live: usize) {
        self.lock().alloc_limit = Some(live);
    }

    /// Make every subsequent submission fail with `error`
    pub fn fail_submissions(&self, error: DriverError) {
        self.lock().submit_error = Some(error);
    }

    /// Park cancelled transfers until `deliver_cancellations`
    pub fn defer_cancellation(&self, defer: bool) {
        self.lock().deferred_cancel = defer;
    }

    // ---- driving transfers ----

    /// Deliver `data` as the result of the pending IN transfer
    ///
    /// Returns false when no read is pending.
    pub fn complete_read(&self, data: &[u8]) -> bool {
        let Some(mut pending) = self.lock().take_pending(true) else {
            return false;
        };
        assert!(
            data.len() <= pending.request.length,
            "read of {} bytes exceeds the {} byte transfer",
            data.len(),
            pending.request.length
        );
        pending.request.buffer[..data.len()].copy_from_slice(data);
        Self::finish(pending, TransferStatus::Completed, data.len());
        true
    }

    /// Frame each payload as a Normal frame and deliver them in one transfer
    pub fn complete_read_frames(&self, payloads: &[&[u8]]) -> bool {
        let mut wire = BytesMut::new();
        for payload in payloads {
            if encode_frame(FrameKind::Normal, payload, &mut wire).is_err() {
                return false;
            }
        }
        self.complete_read(&wire)
    }

    /// Acknowledge the pending OUT transfer in full and return its bytes
    pub fn complete_write(&self) -> Option<Vec<u8>> {
        let pending = {
            let mut state = self.lock();
            let pending = state.take_pending(false)?;
            let length = pending.request.length.min(pending.request.buffer.len());
            state
                .written
                .push(pending.request.buffer[..length].to_vec());
            pending
        };
        let length = pending.request.length.min(pending.request.buffer.len());
        let data = pending.request.buffer[..length].to_vec();
        Self::finish(pending, TransferStatus::Completed, length);
        Some(data)
    }

    /// Acknowledge only `n` bytes of the pending OUT transfer
    pub fn complete_write_partial(&self, n: usize) -> bool {
        let Some(pending) = self.lock().take_pending(false) else {
            return false;
        };
        let n = n.min(pending.request.length);
        Self::finish(pending, TransferStatus::Completed, n);
        true
    }

    /// Finish the pending IN transfer with `status` and no data
    pub fn fail_read(&self, status: TransferStatus) -> bool {
        let Some(pending) = self.lock().take_pending(true) else {
            return false;
        };
        Self::finish(pending, status, 0);
        true
    }

    /// Finish the pending OUT transfer with `status` and no data
    pub fn fail_write(&self, status: TransferStatus) -> bool {
        let Some(pending) = self.lock().take_pending(false) else {
            return false;
        };
        Self::finish(pending, status, 0);
        true
    }

    /// Complete every parked cancellation, returning how many there were
    pub fn deliver_cancellations(&self) -> usize {
        self.fail_cancelled(TransferStatus::Cancelled)
    }

    /// Finish every parked cancellation with `status`, as when the device
    /// goes away before a cancel lands
    pub fn fail_cancelled(&self, status: TransferStatus) -> usize {
        let cancelled = std::mem::take(&mut self.lock().cancelled);
        let count = cancelled.len();
        for pending in cancelled {
            Self::finish(pending, status, 0);
        }
        count
    }

    fn finish(pending: Pending, status: TransferStatus, actual_length: usize) {
        trace!(
            "Mock transfer {} on {:#04x} -> {:?} ({} bytes)",
            pending.transfer, pending.request.endpoint, status, actual_length
        );
        (pending.on_complete)(Completion {
            status,
            buffer: pending.request.buffer,
            actual_length,
        });
    }

    // ---- waiting ----

    /// Block until a write is pending or `timeout` passes
    pub fn wait_for_write(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.has_pending(false))
    }

    /// Block until a read is pending or `timeout` passes
    pub fn wait_for_read(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.has_pending(true))
    }

    /// Block until at least one cancellation is parked or `timeout` passes
    pub fn wait_for_cancel(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| !state.cancelled.is_empty())
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&MockState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if ready(&state) {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, left)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    // ---- inspection ----

    pub fn has_pending_read(&self) -> bool {
        self.lock().has_pending(true)
    }

    pub fn has_pending_write(&self) -> bool {
        self.lock().has_pending(false)
    }

    pub fn is_open(&self) -> bool {
        self.lock().open_devices > 0
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn allocated(&self) -> usize {
        self.lock().allocated
    }

    pub fn freed(&self) -> usize {
        self.lock().freed
    }

    pub fn submitted_reads(&self) -> usize {
        self.lock().submitted_reads
    }

    pub fn submitted_writes(&self) -> usize {
        self.lock().submitted_writes
    }

    /// Every frame acknowledged by `complete_write`, in wire order
    pub fn written_frames(&self) -> Vec<(FrameKind, Vec<u8>)> {
        let written = self.lock().written.clone();
        written
            .iter()
            .flat_map(|transfer| {
                decode_frames(transfer)
                    .filter_map(|frame| frame.ok())
                    .map(|frame| (frame.kind, frame.payload.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl UsbDriver for MockDriver {
    type Device = MockDevice;
    type Transfer = MockTransfer;

    fn open(&self, address: &UsbAddress) -> Result<MockDevice, DriverError> {
        let mut state = self.lock();
        if let Some(error) = state.open_error.clone() {
            return Err(error);
        }
        state.opens += 1;
        state.open_devices += 1;
        Ok(MockDevice { address: *address })
    }

    fn close(&self, _device: MockDevice, _interface: u8) {
        let mut state = self.lock();
        state.closes += 1;
        state.open_devices = state.open_devices.saturating_sub(1);
    }

    fn alloc_transfer(&self) -> Result<MockTransfer, DriverError> {
        let mut state = self.lock();
        let live = state.allocated - state.freed;
        if state.alloc_limit.is_some_and(|limit| live >= limit) {
            return Err(DriverError::Allocation);
        }
        state.allocated += 1;
        state.next_transfer += 1;
        Ok(MockTransfer {
            id: state.next_transfer,
        })
    }

    fn submit_bulk(
        &self,
        transfer: &MockTransfer,
        _device: &MockDevice,
        request: BulkRequest,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        let mut state = self.lock();
        if let Some(error) = state.submit_error.clone() {
            return Err(SubmitError {
                error,
                buffer: request.buffer,
            });
        }
        if state.pending.iter().any(|p| p.transfer == transfer.id) {
            return Err(SubmitError {
                error: DriverError::Busy,
                buffer: request.buffer,
            });
        }

        if is_in_endpoint(request.endpoint) {
            state.submitted_reads += 1;
        } else {
            state.submitted_writes += 1;
        }
        state.pending.push(Pending {
            transfer: transfer.id,
            request,
            on_complete,
        });
        self.changed.notify_all();
        Ok(())
    }

    fn cancel(&self, transfer: &MockTransfer) {
        let mut state = self.lock();
        let Some(index) = state.pending.iter().position(|p| p.transfer == transfer.id) else {
            return;
        };
        let pending = state.pending.remove(index);

        if state.deferred_cancel {
            state.cancelled.push(pending);
            self.changed.notify_all();
            return;
        }
        drop(state);

        // The canceller holds the link lock; deliver from elsewhere
        std::thread::spawn(move || Self::finish(pending, TransferStatus::Cancelled, 0));
    }

    fn free_transfer(&self, _transfer: MockTransfer) {
        self.lock().freed += 1;
    }
}
