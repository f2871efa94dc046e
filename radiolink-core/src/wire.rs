//! Framing: 2-byte big-endian opcode + opcode-specific payload.
//!
//! FILE payload layout:
//! `chunk_size:1, total_length:4 (BE), filename, '\n', start_offset:2 (BE), data`.

use crate::identity::{MacAddr, MAC_STR_LEN};
use crate::protocol::{FileChunk, Frame, Opcode, CONTROL_FRAME_LEN, MAX_FRAME_LEN};

/// Fixed bytes of a FILE frame around the filename and data.
pub const FILE_OVERHEAD: usize = CONTROL_FRAME_LEN + 1 + 4 + 1 + 2;

/// Shortest FILE frame: one-character filename, no data.
const FILE_MIN_LEN: usize = FILE_OVERHEAD + 1;

const FILENAME_OFFSET: usize = CONTROL_FRAME_LEN + 1 + 4;

/// Encode a frame into the bytes handed to the radio.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::with_capacity(CONTROL_FRAME_LEN);
    out.extend_from_slice(&frame.opcode().to_be_bytes());
    match frame {
        Frame::Join { peer } => out.extend_from_slice(peer.to_string().as_bytes()),
        Frame::Channel { channel } => {
            if *channel == 0 {
                return Err(FrameEncodeError::InvalidChannel);
            }
            out.extend_from_slice(channel.to_string().as_bytes());
        }
        Frame::File(chunk) => encode_file_chunk(chunk, &mut out)?,
        _ => {}
    }
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(out.len()));
    }
    Ok(out)
}

fn encode_file_chunk(chunk: &FileChunk, out: &mut Vec<u8>) -> Result<(), FrameEncodeError> {
    if !is_valid_filename(&chunk.filename) {
        return Err(FrameEncodeError::InvalidFilename);
    }
    out.reserve(FILE_OVERHEAD + chunk.filename.len() + chunk.data.len());
    out.push(chunk.chunk_size);
    out.extend_from_slice(&chunk.total_length.to_be_bytes());
    out.extend_from_slice(chunk.filename.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&chunk.offset.to_be_bytes());
    out.extend_from_slice(&chunk.data);
    Ok(())
}

/// Filenames travel newline-terminated, so they must be non-empty and newline-free.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('\n')
}

/// Error encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame of {0} bytes exceeds the radio frame limit")]
    TooLarge(usize),
    #[error("filename must be non-empty and must not contain a newline")]
    InvalidFilename,
    #[error("channel 0 is not a radio channel")]
    InvalidChannel,
}

/// Decode one radio frame.
///
/// Exactly-2-byte frames with a `0xF` high nibble are control frames; longer frames are
/// data frames only if their prefix is JOIN, CHANNEL or FILE. Anything else is
/// `NotProtocol` and belongs to the application.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() < CONTROL_FRAME_LEN {
        return Err(FrameDecodeError::NotProtocol);
    }
    let code = u16::from_be_bytes([bytes[0], bytes[1]]);
    if bytes.len() == CONTROL_FRAME_LEN {
        if bytes[0] & 0xF0 != 0xF0 {
            return Err(FrameDecodeError::NotProtocol);
        }
        let opcode = Opcode::from_u16(code).ok_or(FrameDecodeError::UnknownOpcode(code))?;
        return Frame::control(opcode).ok_or(FrameDecodeError::TooShort {
            opcode,
            expected: min_len(opcode),
            actual: bytes.len(),
        });
    }
    match Opcode::from_u16(code) {
        Some(Opcode::Join) => decode_join(bytes),
        Some(Opcode::Channel) => decode_channel(bytes),
        Some(Opcode::File) => decode_file_chunk(bytes).map(Frame::File),
        _ => Err(FrameDecodeError::NotProtocol),
    }
}

fn min_len(opcode: Opcode) -> usize {
    match opcode {
        Opcode::Join => CONTROL_FRAME_LEN + MAC_STR_LEN,
        Opcode::Channel => CONTROL_FRAME_LEN + 1,
        Opcode::File => FILE_MIN_LEN,
        _ => CONTROL_FRAME_LEN,
    }
}

fn decode_join(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() < min_len(Opcode::Join) {
        return Err(FrameDecodeError::TooShort {
            opcode: Opcode::Join,
            expected: min_len(Opcode::Join),
            actual: bytes.len(),
        });
    }
    let text = std::str::from_utf8(&bytes[CONTROL_FRAME_LEN..]).map_err(|_| {
        FrameDecodeError::InvalidPayload {
            opcode: Opcode::Join,
            reason: "address is not text",
        }
    })?;
    let peer = text
        .parse::<MacAddr>()
        .map_err(|_| FrameDecodeError::InvalidPayload {
            opcode: Opcode::Join,
            reason: "malformed address",
        })?;
    Ok(Frame::Join { peer })
}

fn decode_channel(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let invalid = FrameDecodeError::InvalidPayload {
        opcode: Opcode::Channel,
        reason: "channel is not a number in 1..=255",
    };
    let text = std::str::from_utf8(&bytes[CONTROL_FRAME_LEN..]).map_err(|_| invalid.clone())?;
    // Canonical decimal only: no sign, no leading zero.
    if text.starts_with('0') || !text.bytes().all(|c| c.is_ascii_digit()) {
        return Err(invalid);
    }
    match text.parse::<u8>() {
        Ok(channel) if channel > 0 => Ok(Frame::Channel { channel }),
        _ => Err(invalid),
    }
}

fn decode_file_chunk(bytes: &[u8]) -> Result<FileChunk, FrameDecodeError> {
    let too_short = |expected: usize| FrameDecodeError::TooShort {
        opcode: Opcode::File,
        expected,
        actual: bytes.len(),
    };
    if bytes.len() < FILE_MIN_LEN {
        return Err(too_short(FILE_MIN_LEN));
    }
    let chunk_size = bytes[2];
    let total_length = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let newline = bytes[FILENAME_OFFSET..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| FILENAME_OFFSET + i)
        .ok_or(FrameDecodeError::InvalidPayload {
            opcode: Opcode::File,
            reason: "filename is not newline-terminated",
        })?;
    if newline == FILENAME_OFFSET {
        return Err(FrameDecodeError::InvalidPayload {
            opcode: Opcode::File,
            reason: "empty filename",
        });
    }
    let filename = std::str::from_utf8(&bytes[FILENAME_OFFSET..newline])
        .map_err(|_| FrameDecodeError::InvalidPayload {
            opcode: Opcode::File,
            reason: "filename is not UTF-8",
        })?
        .to_string();
    let data_start = newline + 3;
    if bytes.len() < data_start {
        return Err(too_short(data_start));
    }
    let offset = u16::from_be_bytes([bytes[newline + 1], bytes[newline + 2]]);
    Ok(FileChunk {
        chunk_size,
        total_length,
        filename,
        offset,
        data: bytes[data_start..].to_vec(),
    })
}

/// Error decoding a frame. `TooShort` and `InvalidPayload` are malformed protocol frames;
/// `UnknownOpcode` is an opcode-shaped control frame nobody owns; `NotProtocol` is
/// application traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("{opcode} frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {opcode} payload: {reason}")]
    InvalidPayload {
        opcode: Opcode,
        reason: &'static str,
    },
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),
    #[error("not a protocol frame")]
    NotProtocol,
}

impl FrameDecodeError {
    /// Truncated or unparseable frame of a known opcode.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameDecodeError::TooShort { .. } | FrameDecodeError::InvalidPayload { .. }
        )
    }
}
