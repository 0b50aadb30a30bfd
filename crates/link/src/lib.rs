//! USB data link
//!
//! A socket-like byte stream carried over a pair of USB bulk endpoints.
//!
//! # Architecture
//!
//! - [`UsbDataLink`]: connect/bind/close state machine and the stream API
//! - `scheduler`: one outstanding read and one outstanding write transfer,
//!   completion handling and drain-before-free teardown
//! - [`buffer`]: input byte queue and frame-aware output queue
//! - [`driver`]: the [`UsbDriver`] seam with a `rusb` backend and a mock
//! - [`events`]: lifecycle notifications delivered to an [`EventSink`]
//!
//! Framing and handshake tokens come from the `protocol` crate.

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
mod link;
mod scheduler;
pub mod state;

pub use config::LinkConfig;
pub use driver::{
    BulkRequest, Completion, CompletionHandler, MockDriver, RusbDriver, SubmitError,
    TransferStatus, UsbDriver,
};
pub use error::{ConnectError, DriverError, LinkError, Result};
pub use events::{EventSink, LinkEvent, LinkId, Notification, NullSink, RecordingSink};
pub use link::{Role, UsbDataLink};
pub use state::{Channels, LinkState};
