//! Frame header layout and the queue-level framing step.

use crate::{BinaryQueue, WireError};

/// Version-tagged ASCII magic opening every frame.
pub const SIGNATURE: [u8; 8] = *b"SNTRv1.0";

/// Bytes before the payload: signature + length + opcode + sequence.
pub const HEADER_SIZE: usize = 15;

/// Hard cap on a declared payload length.
pub const MAX_PAYLOAD_LENGTH: usize = 4 * 1024 * 1024;

/// Sequence numbers are issued by the originator and echoed by the responder.
pub type SequenceNumber = u16;

/// Assemble one frame around an already-encoded payload.
pub(crate) fn encode_frame(opcode: u8, sequence: SequenceNumber, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&SIGNATURE);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.push(opcode);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Pop one complete frame off the queue. `Ok(None)` means more data is
/// required; nothing is consumed until a full frame is buffered.
pub(crate) fn decode_frame(
    queue: &mut BinaryQueue,
) -> Result<Option<(u8, SequenceNumber, Vec<u8>)>, WireError> {
    let header = match queue.peek(HEADER_SIZE) {
        Some(h) => h,
        None => return Ok(None),
    };
    if header[..8] != SIGNATURE {
        return Err(WireError::InvalidSignature);
    }
    let length =
        u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if length > MAX_PAYLOAD_LENGTH {
        return Err(WireError::Oversized);
    }
    let opcode = header[12];
    let sequence = u16::from_le_bytes([header[13], header[14]]);
    if queue.size() < HEADER_SIZE + length {
        return Ok(None);
    }
    queue.skip(HEADER_SIZE);
    let payload = queue.consume(length).unwrap_or_default();
    Ok(Some((opcode, sequence, payload)))
}
