//! Chunk manager: split a file into offset-tagged chunks, track receive state, reassemble.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RECEIVE_SESSIONS,
    DEFAULT_RECEIVE_IDLE_TIMEOUT,
};
use crate::identity::MacAddr;
use crate::protocol::{FileChunk, MAX_FRAME_LEN};
use crate::wire::{self, FILE_OVERHEAD};

/// Most data a FILE frame can carry (one-character filename).
pub const MAX_CHUNK_DATA: usize = MAX_FRAME_LEN - FILE_OVERHEAD - 1;

/// Largest file a single transfer can describe: the last chunk must start at a
/// 16-bit offset.
pub const MAX_FILE_LEN: usize = u16::MAX as usize + MAX_CHUNK_DATA;

/// One slice of a file: `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub offset: usize,
    pub len: usize,
}

impl ChunkRange {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Split a file into chunks by fixed size. An empty file is one zero-length chunk so the
/// receiver still creates it; a zero chunk size yields no chunks.
pub fn split_into_chunks(total_len: usize, chunk_size: u8) -> Vec<ChunkRange> {
    let size = chunk_size as usize;
    if size == 0 {
        return Vec::new();
    }
    if total_len == 0 {
        return vec![ChunkRange { offset: 0, len: 0 }];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(size));
    let mut offset = 0;
    while offset < total_len {
        let len = size.min(total_len - offset);
        out.push(ChunkRange { offset, len });
        offset += len;
    }
    out
}

/// Check that a file can be sent as FILE frames of `chunk_size` data bytes.
pub fn validate_transfer(filename: &str, total_len: usize, chunk_size: u8) -> Result<(), ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }
    if !wire::is_valid_filename(filename) {
        return Err(ChunkError::InvalidFilename);
    }
    let frame_len = FILE_OVERHEAD + filename.len() + chunk_size as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(ChunkError::ChunkTooLarge { frame_len });
    }
    let size = chunk_size as usize;
    let last_offset = total_len.saturating_sub(1) / size * size;
    if last_offset > u16::MAX as usize || u32::try_from(total_len).is_err() {
        return Err(ChunkError::FileTooLarge { len: total_len });
    }
    Ok(())
}

/// Receive-side state for one file: a buffer of the declared length, filled by offset.
#[derive(Debug)]
pub struct TransferSession {
    pub filename: String,
    /// Peer that started the session.
    pub peer: MacAddr,
    pub total_length: u32,
    buffer: Vec<u8>,
    high_water: usize,
    last_activity: Instant,
}

impl TransferSession {
    pub fn new(filename: String, peer: MacAddr, total_length: u32, now: Instant) -> Self {
        Self {
            filename,
            peer,
            total_length,
            buffer: vec![0; total_length as usize],
            high_water: 0,
            last_activity: now,
        }
    }

    /// When the last chunk for this file arrived.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Highest byte written so far.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Copy `data` to `offset`. Out-of-range writes are rejected before anything changes.
    /// Returns true if this write ends exactly at the declared length.
    pub fn write(&mut self, offset: u16, data: &[u8]) -> Result<bool, ChunkError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buffer.len() {
            return Err(ChunkError::BoundsViolation {
                filename: self.filename.clone(),
                offset,
                len: data.len(),
                total_length: self.total_length,
            });
        }
        self.buffer[start..end].copy_from_slice(data);
        self.high_water = self.high_water.max(end);
        Ok(end == self.buffer.len())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// The final chunk of a file just written, kept so a retransmitted final chunk is
/// re-acknowledged instead of rewriting the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub total_length: u32,
    pub final_offset: u16,
    pub final_data: Vec<u8>,
    /// After this a matching chunk starts a new transfer.
    pub expires: Instant,
}

impl CompletedTransfer {
    fn matches(&self, chunk: &FileChunk, now: Instant) -> bool {
        now < self.expires
            && self.total_length == chunk.total_length
            && self.final_offset == chunk.offset
            && self.final_data == chunk.data
    }
}

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Result of processing one FILE frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk stored; `high_water` bytes of the file are covered.
    InProgress { high_water: usize },
    /// Chunk stored and it was the final one; the file is ready to write.
    Complete(ReceivedFile),
    /// Retransmitted final chunk of a file that was already written.
    Duplicate,
}

/// Bounds on receive-side memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Sessions held at once; the least recently active one makes room for a new file.
    pub max_sessions: usize,
    /// A session without a new chunk for this long is dropped.
    pub idle_timeout: Duration,
    /// How long a repeated final chunk counts as a retransmission.
    pub duplicate_window: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_RECEIVE_SESSIONS,
            idle_timeout: DEFAULT_RECEIVE_IDLE_TIMEOUT,
            duplicate_window: DEFAULT_ACK_TIMEOUT * u32::from(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

/// Receive sessions keyed by filename.
#[derive(Debug, Default)]
pub struct Reassembler {
    limits: ReassemblyLimits,
    sessions: HashMap<String, TransferSession>,
    completed: HashMap<(MacAddr, String), CompletedTransfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn session(&self, filename: &str) -> Option<&TransferSession> {
        self.sessions.get(filename)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Process a received FILE chunk from `peer`.
    pub fn on_chunk_received(
        &mut self,
        now: Instant,
        peer: MacAddr,
        chunk: &FileChunk,
    ) -> Result<ChunkReceiveResult, ChunkError> {
        let total = chunk.total_length as usize;
        if total > MAX_FILE_LEN {
            return Err(ChunkError::FileTooLarge { len: total });
        }
        if chunk.end() > chunk.total_length as u64 {
            return Err(ChunkError::BoundsViolation {
                filename: chunk.filename.clone(),
                offset: chunk.offset,
                len: chunk.data.len(),
                total_length: chunk.total_length,
            });
        }

        let key = (peer, chunk.filename.clone());
        if !self.sessions.contains_key(&chunk.filename)
            && self
                .completed
                .get(&key)
                .is_some_and(|done| done.matches(chunk, now))
        {
            return Ok(ChunkReceiveResult::Duplicate);
        }

        if !self.sessions.contains_key(&chunk.filename) {
            self.make_room();
        }
        let session = match self.sessions.entry(chunk.filename.clone()) {
            Entry::Occupied(mut o) => {
                if o.get().total_length != chunk.total_length {
                    tracing::debug!(
                        filename = %chunk.filename,
                        old = o.get().total_length,
                        new = chunk.total_length,
                        "total length changed, restarting transfer"
                    );
                    o.insert(TransferSession::new(
                        chunk.filename.clone(),
                        peer,
                        chunk.total_length,
                        now,
                    ));
                }
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert(TransferSession::new(
                chunk.filename.clone(),
                peer,
                chunk.total_length,
                now,
            )),
        };
        session.last_activity = now;

        if !session.write(chunk.offset, &chunk.data)? {
            return Ok(ChunkReceiveResult::InProgress {
                high_water: session.high_water(),
            });
        }

        let Some(session) = self.sessions.remove(&chunk.filename) else {
            return Ok(ChunkReceiveResult::Duplicate);
        };
        self.completed.retain(|_, done| now < done.expires);
        self.completed.insert(
            key,
            CompletedTransfer {
                total_length: chunk.total_length,
                final_offset: chunk.offset,
                final_data: chunk.data.clone(),
                expires: now + self.limits.duplicate_window,
            },
        );
        Ok(ChunkReceiveResult::Complete(ReceivedFile {
            filename: chunk.filename.clone(),
            bytes: session.into_bytes(),
        }))
    }

    /// Drop sessions idle past the timeout and forget stale completions.
    /// Returns the filenames whose partial data was discarded.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let idle = self.limits.idle_timeout;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= idle)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            if let Some(session) = self.sessions.remove(name) {
                tracing::warn!(
                    filename = %name,
                    peer = %session.peer,
                    received = session.high_water(),
                    total = session.total_length,
                    "receive session idle, discarding"
                );
            }
        }
        self.completed.retain(|_, done| now < done.expires);
        stale
    }

    /// Evict the least recently active session if a new one would exceed the cap.
    fn make_room(&mut self) {
        while self.sessions.len() >= self.limits.max_sessions.max(1) {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.last_activity)
                .map(|(name, _)| name.clone())
            else {
                return;
            };
            if let Some(session) = self.sessions.remove(&oldest) {
                tracing::warn!(
                    filename = %oldest,
                    peer = %session.peer,
                    received = session.high_water(),
                    "too many receive sessions, evicting oldest"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk at offset {offset} with {len} bytes overruns {filename:?} ({total_length} bytes)")]
    BoundsViolation {
        filename: String,
        offset: u16,
        len: usize,
        total_length: u32,
    },
    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,
    #[error("filename must be non-empty and must not contain a newline")]
    InvalidFilename,
    #[error("FILE frame of {frame_len} bytes exceeds the radio frame limit")]
    ChunkTooLarge { frame_len: usize },
    #[error("file of {len} bytes is too large for a single transfer")]
    FileTooLarge { len: usize },
}
