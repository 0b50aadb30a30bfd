//! Link error types

use thiserror::Error;

/// Failures reported by a [`UsbDriver`](crate::driver::UsbDriver)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Device not found")]
    NotFound,

    #[error("Access denied")]
    Access,

    #[error("Device or interface busy")]
    Busy,

    #[error("Device disconnected")]
    NoDevice,

    #[error("Transfer allocation failed")]
    Allocation,

    #[error("I/O error")]
    Io,

    #[error("{0}")]
    Other(String),
}

/// Why a connection attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("open device failed: {0}")]
    DeviceOpen(#[source] DriverError),

    #[error("transfer allocation failed: {0}")]
    Allocation(#[source] DriverError),

    #[error("transfer submission failed: {0}")]
    Submit(#[source] DriverError),

    #[error("peer rejected the connection")]
    Rejected,

    #[error("no handshake answer within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("link closed while connecting")]
    Aborted,
}

/// Synchronous errors returned by the link API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    ConnectFailed(#[from] ConnectError),

    #[error("link is already open; close it first")]
    AlreadyOpen,

    #[error("invalid link configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
