//! Connection phase of a link

use std::fmt;

/// Which directions of a live link still move data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    pub readable: bool,
    pub writable: bool,
}

impl Channels {
    pub const OPEN: Channels = Channels {
        readable: true,
        writable: true,
    };

    pub const CLOSED: Channels = Channels {
        readable: false,
        writable: false,
    };
}

/// Lifecycle of a link
///
/// Only the phases that can still move data carry [`Channels`].
///
/// ```text
/// Idle/Closed --bind--> Connected
/// Idle/Closed --connect--> Connecting --accept--> Connected
///                                     --reject--> Rejected
/// Connected --both directions closed, input drained--> Disconnected
/// any --close--> Closing --drained--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never opened
    Idle,
    /// Device open, waiting for the peer's handshake answer
    Connecting(Channels),
    Connected(Channels),
    /// The peer refused, or the handshake could not complete
    Rejected,
    /// Both directions closed after being connected
    Disconnected,
    /// `close` in progress
    Closing(Channels),
    Closed,
}

impl LinkState {
    pub fn channels(&self) -> Option<Channels> {
        match *self {
            LinkState::Connecting(ch) | LinkState::Connected(ch) | LinkState::Closing(ch) => {
                Some(ch)
            }
            _ => None,
        }
    }

    pub(crate) fn channels_mut(&mut self) -> Option<&mut Channels> {
        match self {
            LinkState::Connecting(ch) | LinkState::Connected(ch) | LinkState::Closing(ch) => {
                Some(ch)
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected(_))
    }

    /// The handshake has been decided (or was never needed)
    pub fn is_accepted(&self) -> bool {
        !matches!(self, LinkState::Idle | LinkState::Connecting(_))
    }

    /// Whether callers may still queue output
    pub fn accepts_writes(&self) -> bool {
        match self {
            LinkState::Connecting(ch) | LinkState::Connected(ch) => ch.writable,
            _ => false,
        }
    }

    /// Whether incoming transfers are still consumed
    pub(crate) fn input_open(&self) -> bool {
        self.channels().is_some_and(|ch| ch.readable)
    }

    /// Whether queued output is still pushed to the device
    pub(crate) fn output_open(&self) -> bool {
        self.channels().is_some_and(|ch| ch.writable)
    }

    /// Device and transfers may be held; a new open must close first
    pub(crate) fn holds_device(&self) -> bool {
        !matches!(self, LinkState::Idle | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting(_) => "connecting",
            LinkState::Connected(_) => "connected",
            LinkState::Rejected => "rejected",
            LinkState::Disconnected => "disconnected",
            LinkState::Closing(_) => "closing",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}
