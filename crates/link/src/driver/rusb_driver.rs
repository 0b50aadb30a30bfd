//! libusb-backed driver
//!
//! rusb only exposes blocking bulk transfers, so each allocated transfer owns a
//! worker thread. A submission is handed to the worker over a channel; the
//! worker runs the completion handler on its own thread.
//!
//! The worker moves one max-size packet per blocking call, each bounded by
//! `poll_interval`, so it can notice cancellation and enforce the overall
//! timeout. libusb drops the transferred count when a call times out, but a
//! single packet either went through or did not, so a timed-out call has moved
//! nothing and is simply issued again. A short packet (or a full buffer) ends
//! an IN transfer; an OUT transfer that fills a whole number of packets is
//! terminated with a zero-length packet so the peer's read ends in the same
//! place.

use super::{
    BulkRequest, Completion, CompletionHandler, SubmitError, TransferStatus, UsbDriver,
    is_in_endpoint,
};
use crate::error::DriverError;
use async_channel::{Receiver, Sender};
use common::{DeviceInfo, UsbAddress};
use rusb::{Context, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Smallest slice handed to libusb; a zero timeout would mean "forever"
const MIN_SLICE: Duration = Duration::from_millis(1);

/// Packet size assumed when the endpoint descriptor cannot be read
const DEFAULT_PACKET_SIZE: usize = 512;

/// Driver backed by a libusb context
pub struct RusbDriver {
    context: Context,
    poll_interval: Duration,
}

/// Opened device with its interface claimed
pub struct RusbDevice {
    handle: Arc<DeviceHandle<Context>>,
    in_packet: usize,
    out_packet: usize,
}

/// Transfer slot served by a dedicated worker thread
pub struct RusbTransfer {
    jobs: Sender<Job>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

struct Job {
    handle: Arc<DeviceHandle<Context>>,
    packet: usize,
    request: BulkRequest,
    on_complete: CompletionHandler,
}

/// Blocking bulk calls on one device
trait BulkPipe {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

impl BulkPipe for DeviceHandle<Context> {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }
}

impl RusbDriver {
    /// Create a driver with its own libusb context
    pub fn new(poll_interval: Duration) -> Result<Self, DriverError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            poll_interval: poll_interval.max(MIN_SLICE),
        })
    }

    /// Enumerate attached devices
    ///
    /// Reads manufacturer and product strings when the device can be opened.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut devices = Vec::new();

        for device in list.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            let (manufacturer, product) = device
                .open()
                .map(|handle| {
                    (
                        handle.read_manufacturer_string_ascii(&descriptor).ok(),
                        handle.read_product_string_ascii(&descriptor).ok(),
                    )
                })
                .unwrap_or((None, None));

            devices.push(DeviceInfo {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                bus_number: device.bus_number(),
                device_address: device.address(),
                manufacturer,
                product,
            });
        }

        debug!("Enumerated {} devices", devices.len());
        Ok(devices)
    }
}

impl UsbDriver for RusbDriver {
    type Device = RusbDevice;
    type Transfer = RusbTransfer;

    fn open(&self, address: &UsbAddress) -> Result<RusbDevice, DriverError> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let device = list
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|descriptor| {
                    address.matches(&DeviceInfo {
                        vendor_id: descriptor.vendor_id(),
                        product_id: descriptor.product_id(),
                        bus_number: device.bus_number(),
                        device_address: device.address(),
                        manufacturer: None,
                        product: None,
                    })
                })
            })
            .ok_or(DriverError::NotFound)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", address, e);
            map_rusb_error(e)
        })?;

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}; continuing", e);
        }

        handle.claim_interface(address.interface).map_err(|e| {
            warn!(
                "Failed to claim interface {} on {}: {}",
                address.interface, address, e
            );
            map_rusb_error(e)
        })?;

        let (in_packet, out_packet) = packet_sizes(&device, address);
        info!(
            "Opened {} (bus {:03} device {:03}, packets in={} out={})",
            address,
            device.bus_number(),
            device.address(),
            in_packet,
            out_packet
        );

        Ok(RusbDevice {
            handle: Arc::new(handle),
            in_packet,
            out_packet,
        })
    }

    fn close(&self, device: RusbDevice, interface: u8) {
        if let Err(e) = device.handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        debug!("Closed device");
    }

    fn alloc_transfer(&self) -> Result<RusbTransfer, DriverError> {
        let (jobs, rx) = async_channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let poll_interval = self.poll_interval;

        let worker = std::thread::Builder::new()
            .name("usb-transfer".to_string())
            .spawn(move || run_worker(rx, worker_cancel, poll_interval))
            .map_err(|e| {
                warn!("Failed to spawn transfer worker: {}", e);
                DriverError::Allocation
            })?;

        Ok(RusbTransfer {
            jobs,
            cancel,
            worker: Some(worker),
        })
    }

    fn submit_bulk(
        &self,
        transfer: &RusbTransfer,
        device: &RusbDevice,
        request: BulkRequest,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        transfer.cancel.store(false, Ordering::SeqCst);

        let packet = if is_in_endpoint(request.endpoint) {
            device.in_packet
        } else {
            device.out_packet
        };
        let job = Job {
            handle: device.handle.clone(),
            packet,
            request,
            on_complete,
        };

        transfer.jobs.try_send(job).map_err(|e| {
            let error = if e.is_full() {
                DriverError::Busy
            } else {
                DriverError::Other("transfer worker has exited".to_string())
            };
            SubmitError {
                error,
                buffer: e.into_inner().request.buffer,
            }
        })
    }

    fn cancel(&self, transfer: &RusbTransfer) {
        transfer.cancel.store(true, Ordering::SeqCst);
    }

    fn free_transfer(&self, transfer: RusbTransfer) {
        drop(transfer);
    }
}

impl Drop for RusbTransfer {
    fn drop(&mut self) {
        self.jobs.close();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Transfer worker panicked");
        }
    }
}

/// Worker loop: one job at a time until the channel closes
fn run_worker(jobs: Receiver<Job>, cancel: Arc<AtomicBool>, poll_interval: Duration) {
    while let Ok(job) = jobs.recv_blocking() {
        let Job {
            handle,
            packet,
            mut request,
            on_complete,
        } = job;

        let (status, actual_length) =
            execute_bulk(&*handle, &mut request, packet, &cancel, poll_interval);
        drop(handle);

        trace!(
            "Bulk transfer on {:#04x} finished: {:?}, {} bytes",
            request.endpoint, status, actual_length
        );

        on_complete(Completion {
            status,
            buffer: request.buffer,
            actual_length,
        });
    }

    debug!("Transfer worker exiting");
}

/// Run one bulk transfer packet by packet until it finishes, times out or is
/// cancelled; returns the status and the bytes moved
fn execute_bulk<P: BulkPipe>(
    pipe: &P,
    request: &mut BulkRequest,
    packet: usize,
    cancel: &AtomicBool,
    poll_interval: Duration,
) -> (TransferStatus, usize) {
    let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
    let length = request.length.min(request.buffer.len());
    let endpoint = request.endpoint;
    let is_in = is_in_endpoint(endpoint);
    let packet = packet.max(1);
    let terminate_with_zlp = !is_in && length > 0 && length % packet == 0;
    let mut done = 0;

    if length == 0 {
        return (TransferStatus::Completed, 0);
    }

    loop {
        if cancel.load(Ordering::SeqCst) {
            return (TransferStatus::Cancelled, done);
        }

        let slice = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return (TransferStatus::TimedOut, done);
                }
                left.min(poll_interval)
            }
            None => poll_interval,
        }
        .max(MIN_SLICE);

        // Zero once only the terminating zero-length packet is left
        let chunk = packet.min(length - done);
        let result = if is_in {
            pipe.read_bulk(endpoint, &mut request.buffer[done..done + chunk], slice)
        } else {
            pipe.write_bulk(endpoint, &request.buffer[done..done + chunk], slice)
        };

        match result {
            Ok(n) => {
                let n = n.min(chunk);
                done += n;
                if chunk == 0 || n < chunk || (done == length && !terminate_with_zlp) {
                    return (TransferStatus::Completed, done);
                }
            }
            Err(rusb::Error::Timeout) => continue,
            Err(e) => {
                debug!("Bulk transfer on {:#04x} failed: {}", endpoint, e);
                return (map_transfer_status(e), done);
            }
        }
    }
}

/// Max packet sizes of the bulk IN and OUT endpoints named by `address`
fn packet_sizes(device: &rusb::Device<Context>, address: &UsbAddress) -> (usize, usize) {
    let mut sizes = (DEFAULT_PACKET_SIZE, DEFAULT_PACKET_SIZE);
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            debug!(
                "No active configuration descriptor: {}; assuming {} byte packets",
                e, DEFAULT_PACKET_SIZE
            );
            return sizes;
        }
    };

    for interface in config.interfaces() {
        if interface.number() != address.interface {
            continue;
        }
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                // Bits 11..12 are the high-bandwidth multiplier
                let size = usize::from(endpoint.max_packet_size() & 0x7ff);
                if size == 0 {
                    continue;
                }
                if endpoint.address() == address.bulk_in {
                    sizes.0 = size;
                } else if endpoint.address() == address.bulk_out {
                    sizes.1 = size;
                }
            }
        }
    }
    sizes
}

/// Map rusb::Error to a driver error
pub fn map_rusb_error(err: rusb::Error) -> DriverError {
    match err {
        rusb::Error::NotFound => DriverError::NotFound,
        rusb::Error::Access => DriverError::Access,
        rusb::Error::Busy => DriverError::Busy,
        rusb::Error::NoDevice => DriverError::NoDevice,
        rusb::Error::NoMem => DriverError::Allocation,
        rusb::Error::Io => DriverError::Io,
        _ => DriverError::Other(err.to_string()),
    }
}

/// Map a failed blocking transfer to a completion status
pub fn map_transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}
