//! Sender side of a file transfer: stop-and-wait over FILE / FILE_WRITE_ACK.

use crate::chunk::{self, ChunkError, ChunkRange};
use crate::identity::MacAddr;
use crate::integrity;
use crate::protocol::{FileChunk, Frame};

/// Bytes of a transfer the receiver has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub acked: usize,
    pub total: usize,
}

/// Summary of a transfer the receiver fully acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub peer: MacAddr,
    pub filename: String,
    pub total_length: usize,
    pub chunks: usize,
    /// SHA-256 of the file contents.
    pub digest: [u8; 32],
}

/// How an outgoing transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete(TransferReport),
    /// A chunk exhausted its attempts; `acked` bytes had been confirmed.
    Failed {
        filename: String,
        acked: usize,
        total: usize,
    },
}

/// One file being sent to one peer. The chunk at `next` is in flight.
#[derive(Debug)]
pub struct OutgoingTransfer {
    peer: MacAddr,
    filename: String,
    data: Vec<u8>,
    chunk_size: u8,
    chunks: Vec<ChunkRange>,
    next: usize,
}

impl OutgoingTransfer {
    pub fn new(
        peer: MacAddr,
        filename: &str,
        data: Vec<u8>,
        chunk_size: u8,
    ) -> Result<Self, ChunkError> {
        chunk::validate_transfer(filename, data.len(), chunk_size)?;
        let chunks = chunk::split_into_chunks(data.len(), chunk_size);
        Ok(Self {
            peer,
            filename: filename.to_string(),
            data,
            chunk_size,
            chunks,
            next: 0,
        })
    }

    pub fn peer(&self) -> MacAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// FILE frame for the chunk in flight; `None` once every chunk is acknowledged.
    pub fn current_frame(&self) -> Option<Frame> {
        let range = self.chunks.get(self.next)?;
        Some(Frame::File(FileChunk {
            chunk_size: self.chunk_size,
            // validate_transfer bounds both casts
            total_length: self.data.len() as u32,
            filename: self.filename.clone(),
            offset: range.offset as u16,
            data: self.data[range.offset..range.end()].to_vec(),
        }))
    }

    /// The in-flight chunk was acknowledged. Returns true if another chunk remains.
    pub fn on_chunk_acked(&mut self) -> bool {
        if self.next < self.chunks.len() {
            self.next += 1;
        }
        self.next < self.chunks.len()
    }

    pub fn progress(&self) -> Progress {
        let acked = self
            .chunks
            .get(self.next)
            .map_or(self.data.len(), |c| c.offset);
        Progress {
            acked,
            total: self.data.len(),
        }
    }

    pub fn report(&self) -> TransferReport {
        TransferReport {
            peer: self.peer,
            filename: self.filename.clone(),
            total_length: self.data.len(),
            chunks: self.chunks.len(),
            digest: integrity::hash_file(&self.data),
        }
    }
}
