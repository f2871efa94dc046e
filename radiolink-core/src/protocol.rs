//! radiolink wire protocol: opcodes, frame types, size limits.

use std::fmt;

use crate::identity::MacAddr;

/// Largest frame the radio carries in one transmission.
pub const MAX_FRAME_LEN: usize = 250;

/// Control frames are the bare 2-byte opcode.
pub const CONTROL_FRAME_LEN: usize = 2;

/// Frame opcodes. Serialized as big-endian `u16` in the first two bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Immediate reboot on receipt.
    Reset = 0xFFFF,
    /// Generic acknowledgment.
    Ack = 0xFFFE,
    /// Discovery beacon, broadcast by a device looking for a peer.
    Boot = 0xFF00,
    /// Peer introduction: payload is an address in text form.
    Join = 0xFF13,
    /// Channel directive: payload is the channel number in decimal ASCII.
    Channel = 0xFF14,
    /// Stop the application and service only radio traffic.
    Stop = 0xF4FE,
    /// One chunk of a file transfer.
    File = 0xF410,
    /// Transfer complete; the file was written.
    Done = 0xF411,
    /// One chunk was written.
    FileWriteAck = 0xF412,
}

impl Opcode {
    pub fn from_u16(code: u16) -> Option<Self> {
        let op = match code {
            0xFFFF => Opcode::Reset,
            0xFFFE => Opcode::Ack,
            0xFF00 => Opcode::Boot,
            0xFF13 => Opcode::Join,
            0xFF14 => Opcode::Channel,
            0xF4FE => Opcode::Stop,
            0xF410 => Opcode::File,
            0xF411 => Opcode::Done,
            0xF412 => Opcode::FileWriteAck,
            _ => return None,
        };
        Some(op)
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.to_u16().to_be_bytes()
    }

    /// Whether frames with this opcode carry a structured payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Opcode::Join | Opcode::Channel | Opcode::File)
    }

    /// Reply a sender waits for after transmitting this opcode.
    pub fn expected_reply(self) -> Opcode {
        match self {
            // A reset peer announces itself again once it is back up.
            Opcode::Reset => Opcode::Boot,
            Opcode::File => Opcode::FileWriteAck,
            _ => Opcode::Ack,
        }
    }

    /// Whether retransmitting on a missed reply is safe.
    pub fn is_retransmittable(self) -> bool {
        !matches!(self, Opcode::Reset)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Reset => "RESET",
            Opcode::Ack => "ACK",
            Opcode::Boot => "BOOT",
            Opcode::Join => "JOIN",
            Opcode::Channel => "CHANNEL",
            Opcode::Stop => "STOP",
            Opcode::File => "FILE",
            Opcode::Done => "DONE",
            Opcode::FileWriteAck => "FILE_WRITE_ACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All frames the protocol core owns. Anything else on the air is application traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Reset,
    Ack,
    Boot,
    Stop,
    Done,
    FileWriteAck,
    /// Introduce `peer` to the receiver.
    Join { peer: MacAddr },
    /// Move the receiver to `channel`.
    Channel { channel: u8 },
    File(FileChunk),
}

impl Frame {
    /// Control frame for an opcode without payload; `None` for JOIN, CHANNEL, FILE.
    pub fn control(opcode: Opcode) -> Option<Frame> {
        let frame = match opcode {
            Opcode::Reset => Frame::Reset,
            Opcode::Ack => Frame::Ack,
            Opcode::Boot => Frame::Boot,
            Opcode::Stop => Frame::Stop,
            Opcode::Done => Frame::Done,
            Opcode::FileWriteAck => Frame::FileWriteAck,
            Opcode::Join | Opcode::Channel | Opcode::File => return None,
        };
        Some(frame)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Reset => Opcode::Reset,
            Frame::Ack => Opcode::Ack,
            Frame::Boot => Opcode::Boot,
            Frame::Stop => Opcode::Stop,
            Frame::Done => Opcode::Done,
            Frame::FileWriteAck => Opcode::FileWriteAck,
            Frame::Join { .. } => Opcode::Join,
            Frame::Channel { .. } => Opcode::Channel,
            Frame::File(_) => Opcode::File,
        }
    }

    pub fn is_control(&self) -> bool {
        !self.opcode().has_payload()
    }
}

/// One slice of a file, tagged with its absolute offset and the file's total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Sender's chunk size for this transfer; the final chunk may be shorter.
    pub chunk_size: u8,
    pub total_length: u32,
    pub filename: String,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl FileChunk {
    /// Byte just past this chunk, widened so it cannot overflow.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.data.len() as u64
    }

    /// Whether this chunk ends exactly at the declared total length.
    pub fn is_final(&self) -> bool {
        self.end() == self.total_length as u64
    }
}
