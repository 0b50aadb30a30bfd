//! Handshake tokens
//!
//! An actively opened link sends the connect token as ordinary Normal payload
//! and waits for the peer to answer with the accept or reject token. Until the
//! answer arrives, incoming payload belongs to the handshake and is never
//! surfaced as stream data.

/// Token sent by the connecting side
pub const CONNECT_TOKEN: &[u8] = b"USB_CONNECT";

/// Token sent by the passive side to accept a connection
pub const ACCEPT_TOKEN: &[u8] = b"USB_ACCEPT";

/// Token sent by the passive side to refuse a connection
pub const REJECT_TOKEN: &[u8] = b"USB_REJECT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeToken {
    Connect,
    Accept,
    Reject,
}

impl HandshakeToken {
    /// Literal ASCII bytes of the token
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            HandshakeToken::Connect => CONNECT_TOKEN,
            HandshakeToken::Accept => ACCEPT_TOKEN,
            HandshakeToken::Reject => REJECT_TOKEN,
        }
    }

    /// Match a complete payload against the known tokens
    pub fn parse(payload: &[u8]) -> Option<Self> {
        [
            HandshakeToken::Connect,
            HandshakeToken::Accept,
            HandshakeToken::Reject,
        ]
        .into_iter()
        .find(|token| token.as_bytes() == payload)
    }
}
