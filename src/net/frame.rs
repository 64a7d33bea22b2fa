//! Length-prefixed frame transport
//!
//! The wire format is a big-endian `u32` payload length followed by exactly
//! that many payload bytes. Payload contents are opaque at this layer; the
//! first four payload bytes carry the packet type tag that the quarantine
//! filter inspects, but nothing here depends on that.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Size of the length prefix in bytes
pub const LEN_PREFIX: usize = 4;

/// Transport-level errors
///
/// Always terminal for the receive loop that observes them; there is no
/// retry at this layer. A truncated stream (declared length never satisfied
/// before close) surfaces as `Io`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("peer is gone")]
    PeerGone,
}

/// Codec for length-prefixed binary frames.
///
/// One `decode` returns exactly one complete frame or `None`; a frame is
/// never yielded partially. The declared length is not validated against a
/// maximum, so a peer can claim an arbitrarily large frame — an accepted
/// limitation of the protocol.
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Length (4) + payload, written as one logical unit
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the full prefix first
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Wait for the complete frame
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }

    // The default decode_eof rejects leftover bytes at stream end, which is
    // exactly the malformed-frame policy: a short final frame is an error,
    // never a partial delivery.
}

/// One socket wrapped in the frame codec: one frame per read, one frame per
/// write, no coalescing.
pub type FramedChannel = Framed<TcpStream, FrameCodec>;

/// Wrap a connected socket in the frame codec.
pub fn framed(stream: TcpStream) -> FramedChannel {
    Framed::new(stream, FrameCodec)
}
