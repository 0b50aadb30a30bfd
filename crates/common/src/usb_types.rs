//! USB addressing types
//!
//! A link is bound to exactly one device and one pair of bulk endpoints. The
//! textual form of an address is
//!
//! ```text
//! VID:PID[@BUS.ADDR][/IN,OUT[,IFACE]]
//! ```
//!
//! VID, PID and endpoint numbers are hexadecimal (with or without `0x`), bus,
//! device address and interface are decimal. Endpoints default to `0x81`/`0x01`
//! on interface 0.
//!
//! ```
//! use common::UsbAddress;
//!
//! let addr: UsbAddress = "0x1234:0x5678@1.5/0x82,0x02".parse().unwrap();
//! assert_eq!(addr.vendor_id, 0x1234);
//! assert_eq!(addr.bus_number, Some(1));
//! assert_eq!(addr.bulk_in, 0x82);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default bulk IN endpoint
pub const DEFAULT_BULK_IN: u8 = 0x81;

/// Default bulk OUT endpoint
pub const DEFAULT_BULK_OUT: u8 = 0x01;

/// Direction bit of an endpoint address
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Where a link lives: which device, which interface, which bulk endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Restrict matching to this bus (any bus when `None`)
    pub bus_number: Option<u8>,
    /// Restrict matching to this device address (any address when `None`)
    pub device_address: Option<u8>,
    pub interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
}

impl UsbAddress {
    /// Address a device by VID:PID using the default endpoints
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number: None,
            device_address: None,
            interface: 0,
            bulk_in: DEFAULT_BULK_IN,
            bulk_out: DEFAULT_BULK_OUT,
        }
    }

    /// Pin the address to a bus position
    pub fn at(mut self, bus_number: u8, device_address: u8) -> Self {
        self.bus_number = Some(bus_number);
        self.device_address = Some(device_address);
        self
    }

    /// Override the bulk endpoint pair and interface
    pub fn with_endpoints(mut self, bulk_in: u8, bulk_out: u8, interface: u8) -> Self {
        self.bulk_in = bulk_in;
        self.bulk_out = bulk_out;
        self.interface = interface;
        self
    }

    /// Whether an enumerated device is the one this address points at
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id == info.vendor_id
            && self.product_id == info.product_id
            && self.bus_number.is_none_or(|bus| bus == info.bus_number)
            && self
                .device_address
                .is_none_or(|addr| addr == info.device_address)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.bulk_in & ENDPOINT_DIR_IN == 0 {
            return Err(crate::Error::Address(format!(
                "bulk IN endpoint {:#04x} lacks the IN direction bit",
                self.bulk_in
            )));
        }
        if self.bulk_out & ENDPOINT_DIR_IN != 0 {
            return Err(crate::Error::Address(format!(
                "bulk OUT endpoint {:#04x} has the IN direction bit set",
                self.bulk_out
            )));
        }
        Ok(())
    }
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let (Some(bus), Some(addr)) = (self.bus_number, self.device_address) {
            write!(f, "@{}.{}", bus, addr)?;
        }
        write!(
            f,
            "/{:#04x},{:#04x},{}",
            self.bulk_in, self.bulk_out, self.interface
        )
    }
}

impl FromStr for UsbAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        let (device, endpoints) = match s.split_once('/') {
            Some((device, endpoints)) => (device, Some(endpoints)),
            None => (s, None),
        };
        let (ids, position) = match device.split_once('@') {
            Some((ids, position)) => (ids, Some(position)),
            None => (device, None),
        };

        let (vid, pid) = ids
            .split_once(':')
            .ok_or_else(|| address_error(s, "expected VID:PID"))?;
        let mut address = UsbAddress::new(parse_hex_u16(vid, "VID")?, parse_hex_u16(pid, "PID")?);

        if let Some(position) = position {
            let (bus, addr) = position
                .split_once('.')
                .ok_or_else(|| address_error(s, "expected BUS.ADDR after '@'"))?;
            let bus = bus
                .parse()
                .map_err(|_| address_error(s, "bus number is not a decimal byte"))?;
            let addr = addr
                .parse()
                .map_err(|_| address_error(s, "device address is not a decimal byte"))?;
            address = address.at(bus, addr);
        }

        if let Some(endpoints) = endpoints {
            let parts: Vec<&str> = endpoints.split(',').map(str::trim).collect();
            if !(2..=3).contains(&parts.len()) {
                return Err(address_error(s, "expected IN,OUT[,IFACE] after '/'"));
            }
            let bulk_in = parse_hex_u8(parts[0], "bulk IN endpoint")?;
            let bulk_out = parse_hex_u8(parts[1], "bulk OUT endpoint")?;
            let interface = match parts.get(2) {
                Some(iface) => iface
                    .parse()
                    .map_err(|_| address_error(s, "interface is not a decimal byte"))?,
                None => 0,
            };
            address = address.with_endpoints(bulk_in, bulk_out, interface);
        }

        address.validate()?;
        Ok(address)
    }
}

impl TryFrom<String> for UsbAddress {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl From<UsbAddress> for String {
    fn from(address: UsbAddress) -> Self {
        address.to_string()
    }
}

/// Enumerated device as reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

fn address_error(input: &str, reason: &str) -> crate::Error {
    crate::Error::Address(format!("invalid USB address '{}': {}", input, reason))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or(s.trim())
}

fn parse_hex_u16(s: &str, name: &str) -> crate::Result<u16> {
    let hex = strip_hex_prefix(s);
    if hex.is_empty() || hex.len() > 4 {
        return Err(crate::Error::Address(format!(
            "invalid {} '{}', expected 1-4 hex digits",
            name, s
        )));
    }
    u16::from_str_radix(hex, 16)
        .map_err(|_| crate::Error::Address(format!("invalid {} '{}', not a hex number", name, s)))
}

fn parse_hex_u8(s: &str, name: &str) -> crate::Result<u8> {
    let hex = strip_hex_prefix(s);
    if hex.is_empty() || hex.len() > 2 {
        return Err(crate::Error::Address(format!(
            "invalid {} '{}', expected 1-2 hex digits",
            name, s
        )));
    }
    u8::from_str_radix(hex, 16)
        .map_err(|_| crate::Error::Address(format!("invalid {} '{}', not a hex number", name, s)))
}
