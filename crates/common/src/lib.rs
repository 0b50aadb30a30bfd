//! Common utilities for the USB data link
//!
//! This crate provides what the link engine and the command-line front end
//! share: the error type, tracing setup, and the USB addressing types used to
//! pick a device and its bulk endpoints.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceInfo, UsbAddress};
