//! Frame encoding and decoding for the USB data link
//!
//! Every physical bulk transfer carries one or more frames packed back-to-back.
//! A frame is a fixed-size header followed by its payload, with no padding.
//!
//! # Frame Format
//!
//! ```text
//! [Kind: u32 (little-endian)][Length: u32 (little-endian)][Payload: Length bytes]
//! ```
//!
//! A frame never straddles two physical transfers, so a decoder only ever looks
//! at the bytes of a single completed transfer.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BytesMut;

/// Size of the encoded frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload a single frame can describe
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Frame kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameKind {
    /// Ordinary stream payload (handshake tokens included)
    Normal = 0,
    /// Peer is closing its side of the link
    Disconnect = 1,
}

impl TryFrom<u32> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Normal),
            1 => Ok(FrameKind::Disconnect),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u32,
}

impl FrameHeader {
    /// Serialize the header into its wire representation
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.kind as u32);
        LittleEndian::write_u32(&mut bytes[4..8], self.length);
        bytes
    }

    /// Parse a header from the start of `src`
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedHeader {
                needed: HEADER_SIZE,
                available: src.len(),
            });
        }

        let kind = FrameKind::try_from(LittleEndian::read_u32(&src[0..4]))?;
        let length = LittleEndian::read_u32(&src[4..8]);

        Ok(Self { kind, length })
    }

    /// Total encoded size of the frame this header describes
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

/// A frame borrowed from a transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: FrameKind,
    pub payload: &'a [u8],
}

/// Number of bytes `payload_len` occupies once framed
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len
}

/// Append one frame to `dst`
///
/// # Example
/// ```
/// use bytes::BytesMut;
/// use protocol::{FrameKind, HEADER_SIZE, encode_frame};
///
/// let mut out = BytesMut::new();
/// encode_frame(FrameKind::Normal, b"hello", &mut out).unwrap();
/// assert_eq!(out.len(), HEADER_SIZE + 5);
/// ```
pub fn encode_frame(kind: FrameKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let header = FrameHeader {
        kind,
        length: payload.len() as u32,
    };

    dst.reserve(encoded_len(payload.len()));
    dst.extend_from_slice(&header.to_bytes());
    dst.extend_from_slice(payload);
    Ok(())
}

/// Iterate over the frames packed into one completed transfer
///
/// # Example
/// ```
/// use bytes::BytesMut;
/// use protocol::{FrameKind, decode_frames, encode_frame};
///
/// let mut transfer = BytesMut::new();
/// encode_frame(FrameKind::Normal, b"one", &mut transfer).unwrap();
/// encode_frame(FrameKind::Normal, b"two", &mut transfer).unwrap();
///
/// let payloads: Vec<&[u8]> = decode_frames(&transfer)
///     .map(|frame| frame.unwrap().payload)
///     .collect();
/// assert_eq!(payloads, vec![&b"one"[..], &b"two"[..]]);
/// ```
pub fn decode_frames(transfer: &[u8]) -> FrameDecoder<'_> {
    FrameDecoder {
        remaining: transfer,
        failed: false,
    }
}

/// Iterator returned by [`decode_frames`]
///
/// Yields frames until the transfer is exhausted. After the first error the
/// stream is considered desynchronized and the iterator is fused.
#[derive(Debug)]
pub struct FrameDecoder<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> FrameDecoder<'a> {
    /// Bytes not yet consumed by the decoder
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl<'a> Iterator for FrameDecoder<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }

        let header = match FrameHeader::decode(self.remaining) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        if header.frame_len() > self.remaining.len() {
            self.failed = true;
            return Some(Err(ProtocolError::LengthOverrun {
                declared: header.length as usize,
                remaining: self.remaining.len() - HEADER_SIZE,
            }));
        }

        let (frame, rest) = self.remaining.split_at(header.frame_len());
        self.remaining = rest;

        Some(Ok(Frame {
            kind: header.kind,
            payload: &frame[HEADER_SIZE..],
        }))
    }
}

impl std::iter::FusedIterator for FrameDecoder<'_> {}
