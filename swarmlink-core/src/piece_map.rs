//! Per-transfer record of which chunks of the target file are present.
//!
//! Pure bookkeeping, no I/O. Every transition is idempotent so duplicate or
//! out-of-order chunk responses cannot corrupt the accounting.

use serde::Serialize;

/// Lifecycle of a single chunk within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkState {
    Missing,
    InFlight,
    Complete,
}

/// Errors raised by piece map operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PieceMapError {
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("Chunk {index} out of range (file has {chunk_count} chunks)")]
    IndexOutOfRange { index: u32, chunk_count: u32 },

    #[error("File of {file_size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { file_size: u64, chunk_size: u64 },
}

/// Number of `chunk_size` chunks covering `file_size` bytes.
///
/// # Errors
/// - `PieceMapError::ZeroChunkSize` - If `chunk_size` is zero
/// - `PieceMapError::TooManyChunks` - If the count does not fit a chunk index
pub fn chunk_count_for(file_size: u64, chunk_size: u64) -> Result<u32, PieceMapError> {
    if chunk_size == 0 {
        return Err(PieceMapError::ZeroChunkSize);
    }
    u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| PieceMapError::TooManyChunks {
        file_size,
        chunk_size,
    })
}

/// Chunk state table for one file.
#[derive(Debug, Clone)]
pub struct PieceMap {
    file_size: u64,
    chunk_size: u64,
    states: Vec<ChunkState>,
    missing: u32,
    in_flight: u32,
    completed_bytes: u64,
}

impl PieceMap {
    /// Creates a map with every chunk `Missing`.
    ///
    /// # Errors
    /// - `PieceMapError::ZeroChunkSize` - If `chunk_size` is zero
    /// - `PieceMapError::TooManyChunks` - If the file has more than `u32::MAX` chunks
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, PieceMapError> {
        let chunk_count = chunk_count_for(file_size, chunk_size)?;
        Ok(Self {
            file_size,
            chunk_size,
            states: vec![ChunkState::Missing; chunk_count as usize],
            missing: chunk_count,
            in_flight: 0,
            completed_bytes: 0,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.states.len() as u32
    }

    /// Byte range `(offset, length)` covered by a chunk. The last chunk may be short.
    pub fn chunk_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.chunk_count() {
            return None;
        }
        let offset = index as u64 * self.chunk_size;
        let length = self.chunk_size.min(self.file_size - offset);
        Some((offset, length))
    }

    /// Current state of a chunk.
    pub fn state(&self, index: u32) -> Option<ChunkState> {
        self.states.get(index as usize).copied()
    }

    /// Moves a `Missing` chunk to `InFlight`.
    ///
    /// Returns `false` without changing anything if the chunk was not missing.
    ///
    /// # Errors
    /// - `PieceMapError::IndexOutOfRange` - Unknown chunk index
    pub fn mark_in_flight(&mut self, index: u32) -> Result<bool, PieceMapError> {
        match self.slot(index)? {
            ChunkState::Missing => {
                self.set(index, ChunkState::InFlight);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Marks a chunk `Complete`.
    ///
    /// Returns `true` only for the first completion of the chunk; repeated
    /// completions leave the byte accounting untouched.
    ///
    /// # Errors
    /// - `PieceMapError::IndexOutOfRange` - Unknown chunk index
    pub fn mark_complete(&mut self, index: u32) -> Result<bool, PieceMapError> {
        match self.slot(index)? {
            ChunkState::Complete => Ok(false),
            _ => {
                self.set(index, ChunkState::Complete);
                Ok(true)
            }
        }
    }

    /// Returns a chunk to `Missing`, reporting the state it was in.
    ///
    /// # Errors
    /// - `PieceMapError::IndexOutOfRange` - Unknown chunk index
    pub fn mark_missing(&mut self, index: u32) -> Result<ChunkState, PieceMapError> {
        let previous = self.slot(index)?;
        if previous != ChunkState::Missing {
            self.set(index, ChunkState::Missing);
        }
        Ok(previous)
    }

    /// Indices of all chunks currently `Missing`, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.indices_in(ChunkState::Missing)
    }

    /// Indices of all chunks currently `InFlight`, ascending.
    pub fn in_flight_chunks(&self) -> Vec<u32> {
        self.indices_in(ChunkState::InFlight)
    }

    pub fn completed_chunks(&self) -> u32 {
        self.chunk_count() - self.missing - self.in_flight
    }

    /// Sum of the lengths of all completed chunks.
    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    /// True once no chunk is `Missing` or `InFlight`.
    pub fn is_drained(&self) -> bool {
        self.missing == 0 && self.in_flight == 0
    }

    fn slot(&self, index: u32) -> Result<ChunkState, PieceMapError> {
        self.state(index).ok_or(PieceMapError::IndexOutOfRange {
            index,
            chunk_count: self.chunk_count(),
        })
    }

    fn set(&mut self, index: u32, next: ChunkState) {
        let previous = self.states[index as usize];
        let length = self.chunk_range(index).map(|(_, len)| len).unwrap_or(0);

        match previous {
            ChunkState::Missing => self.missing -= 1,
            ChunkState::InFlight => self.in_flight -= 1,
            ChunkState::Complete => self.completed_bytes -= length,
        }
        match next {
            ChunkState::Missing => self.missing += 1,
            ChunkState::InFlight => self.in_flight += 1,
            ChunkState::Complete => self.completed_bytes += length,
        }

        self.states[index as usize] = next;
    }

    fn indices_in(&self, wanted: ChunkState) -> Vec<u32> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == wanted)
            .map(|(i, _)| i as u32)
            .collect()
    }
}
