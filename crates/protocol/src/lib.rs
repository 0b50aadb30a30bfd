//! Wire protocol for the USB data link
//!
//! This crate defines how stream payload is framed on the bulk endpoints and the
//! handshake tokens exchanged when a link is actively opened. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol::{FrameKind, HandshakeToken, decode_frames, encode_frame};
//!
//! // Frame the connect token as ordinary payload
//! let mut transfer = BytesMut::new();
//! encode_frame(FrameKind::Normal, HandshakeToken::Connect.as_bytes(), &mut transfer).unwrap();
//!
//! // Decode it again on the other side
//! let frame = decode_frames(&transfer).next().unwrap().unwrap();
//! assert_eq!(HandshakeToken::parse(frame.payload), Some(HandshakeToken::Connect));
//! ```

pub mod codec;
pub mod error;
pub mod handshake;

pub use codec::{
    Frame, FrameDecoder, FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, decode_frames,
    encode_frame, encoded_len,
};
pub use error::{ProtocolError, Result};
pub use handshake::{ACCEPT_TOKEN, CONNECT_TOKEN, HandshakeToken, REJECT_TOKEN};
