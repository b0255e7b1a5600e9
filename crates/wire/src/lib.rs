//! Framed wire codec for the sentra local IPC protocol.
//!
//! Frames are length-prefixed and strictly validated:
//!
//! ```text
//! offset  size  field
//! 0       8     magic signature (version-tagged ASCII)
//! 8       4     payload length (u32, little-endian)
//! 12      1     opcode
//! 13      2     sequence number (u16, little-endian)
//! 15      n     payload
//! ```
//!
//! Decoding a partial frame yields `Ok(None)` without consuming anything;
//! every violation of the format is a [`WireError`] and tears the
//! connection down at the caller.

#![deny(unsafe_code)]

pub mod frame;
pub mod message;
pub mod queue;
mod ser;

pub use frame::{SequenceNumber, HEADER_SIZE, MAX_PAYLOAD_LENGTH, SIGNATURE};
pub use message::{AgentMsgType, Message, OpCode, ResponseCode};
pub use queue::BinaryQueue;

use thiserror::Error;

/// Protocol violation kinds. Any of these closes the offending connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The 8-byte magic did not match.
    #[error("invalid frame signature")]
    InvalidSignature,
    /// Unknown opcode, or an opcode the receiving role does not accept.
    #[error("wrong opcode")]
    WrongOpCode,
    /// Payload ran out of data while deserializing the declared operation.
    #[error("frame payload truncated")]
    Truncated,
    /// Payload bytes remained after the declared operation was read.
    #[error("trailing bytes after payload")]
    TrailingBytes,
    /// Declared payload length exceeds [`MAX_PAYLOAD_LENGTH`]; refused
    /// before allocation since peers are untrusted.
    #[error("declared frame length exceeds cap")]
    Oversized,
    /// A field did not parse as its declared type (non-UTF-8 string,
    /// out-of-range boolean or enum tag).
    #[error("malformed field in payload")]
    Malformed,
}
