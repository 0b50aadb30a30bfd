//! USB driver seam
//!
//! The link never talks to USB directly. It drives a [`UsbDriver`], which
//! opens devices and runs bulk transfers asynchronously. A submitted transfer
//! takes ownership of its buffer; the driver hands the buffer back inside the
//! [`Completion`] it delivers to the completion handler, from whatever thread
//! the driver uses for completions.
//!
//! Two drivers ship with the crate:
//! - [`RusbDriver`]: libusb through `rusb`, one worker thread per transfer
//! - [`MockDriver`]: in-memory, completions delivered on demand by tests

use crate::error::DriverError;
use common::UsbAddress;
use std::time::Duration;

pub mod mock;
pub mod rusb_driver;

pub use mock::MockDriver;
pub use rusb_driver::RusbDriver;

/// Direction bit of an endpoint address
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Whether `endpoint` is device-to-host
pub fn is_in_endpoint(endpoint: u8) -> bool {
    endpoint & ENDPOINT_DIR_IN != 0
}

/// Final status of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    /// The device went away
    NoDevice,
    /// Endpoint halted
    Stall,
    /// Device sent more than requested
    Overflow,
    Error,
}

/// A finished transfer, handing its buffer back to the submitter
#[derive(Debug)]
pub struct Completion {
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    /// Bytes actually moved, at most the submitted length
    pub actual_length: usize,
}

impl Completion {
    /// Bytes delivered by an IN transfer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

/// Callback invoked once per submitted transfer
pub type CompletionHandler = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One bulk transfer to submit
#[derive(Debug)]
pub struct BulkRequest {
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    /// Bytes to move: read up to, or write exactly, `buffer[..length]`
    pub length: usize,
    /// None waits forever
    pub timeout: Option<Duration>,
}

/// Submission refused; the buffer is returned to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: DriverError,
    pub buffer: Vec<u8>,
}

/// Architecture-specific USB transfer primitives
///
/// Completion handlers must never be invoked from inside `submit_bulk` or
/// `cancel`: the caller holds its own lock across those calls and the handler
/// takes the same lock.
pub trait UsbDriver: Send + Sync + 'static {
    type Device: Send + 'static;
    type Transfer: Send + 'static;

    /// Open the device at `address` and claim its interface
    fn open(&self, address: &UsbAddress) -> Result<Self::Device, DriverError>;

    /// Release the interface and close the device
    fn close(&self, device: Self::Device, interface: u8);

    fn alloc_transfer(&self) -> Result<Self::Transfer, DriverError>;

    /// Start a transfer; `on_complete` runs exactly once unless this returns an error
    fn submit_bulk(
        &self,
        transfer: &Self::Transfer,
        device: &Self::Device,
        request: BulkRequest,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError>;

    /// Request cancellation; the completion still arrives, with `Cancelled`
    /// status if the transfer had not finished yet. A no-op when idle.
    fn cancel(&self, transfer: &Self::Transfer);

    /// Release a transfer that has no submission outstanding
    fn free_transfer(&self, transfer: Self::Transfer);
}
