//! The chunk plan: a fixed enumeration of byte ranges and the per-chunk
//! state machine the scheduler drives.

use dashmap::DashMap;
use serde::Serialize;

/// Per-chunk upload state.
///
/// `Pending → Uploading → (Success | ErrorRetry | ErrorFatal)`, with
/// `ErrorRetry → Pending` once the backoff timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    Pending,
    Uploading,
    Success,
    ErrorRetry,
    ErrorFatal,
}

/// One entry of the chunk plan.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSlot {
    pub index: usize,
    /// Absolute start offset in the source file.
    pub start: u64,
    /// Exclusive end offset; `end - start` is the bytes on the wire.
    pub end: u64,
    pub state: ChunkState,
    pub attempts: u32,
}

impl ChunkSlot {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Complete chunk enumeration for one file. Slots live in a concurrent map so
/// workers mutate their own entries while progress snapshots read the table.
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    slots: DashMap<usize, ChunkSlot>,
}

impl ChunkPlan {
    /// Build the plan, seeding SUCCESS for chunks the server already holds.
    pub fn new(file_size: u64, chunk_size: u64, already_uploaded: &[usize]) -> Self {
        let total = Self::num_chunks_for(file_size, chunk_size);
        let slots = DashMap::with_capacity(total);

        for index in 0..total {
            let start = index as u64 * chunk_size;
            let end = (start + chunk_size).min(file_size);
            let state = if already_uploaded.contains(&index) {
                ChunkState::Success
            } else {
                ChunkState::Pending
            };
            slots.insert(
                index,
                ChunkSlot {
                    index,
                    start,
                    end,
                    state,
                    attempts: 0,
                },
            );
        }

        Self {
            file_size,
            chunk_size,
            slots,
        }
    }

    /// `ceil(file_size / chunk_size)`; an empty file still gets one chunk so
    /// the transfer has something to finalize.
    pub fn num_chunks_for(file_size: u64, chunk_size: u64) -> usize {
        if file_size == 0 || chunk_size == 0 {
            return 1;
        }
        file_size.div_ceil(chunk_size) as usize
    }

    pub fn num_chunks(&self) -> usize {
        self.slots.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn get(&self, index: usize) -> Option<ChunkSlot> {
        self.slots.get(&index).map(|slot| slot.clone())
    }

    /// Indices currently PENDING, lowest first.
    pub fn pending_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .slots
            .iter()
            .filter(|entry| entry.state == ChunkState::Pending)
            .map(|entry| entry.index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Everything that is not SUCCESS, for a resume pass after failure.
    pub fn non_success_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .slots
            .iter()
            .filter(|entry| entry.state != ChunkState::Success)
            .map(|entry| entry.index)
            .collect();
        indices.sort_unstable();
        indices
    }

    pub fn all_success(&self) -> bool {
        self.slots
            .iter()
            .all(|entry| entry.state == ChunkState::Success)
    }

    /// Bytes already confirmed by the server, for seeding the byte counter.
    pub fn success_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter(|entry| entry.state == ChunkState::Success)
            .map(|entry| entry.len())
            .sum()
    }

    pub fn set_state(&self, index: usize, state: ChunkState) {
        if let Some(mut slot) = self.slots.get_mut(&index) {
            slot.state = state;
        }
    }

    /// Count one attempt and return the new total for the slot.
    pub fn record_attempt(&self, index: usize) -> u32 {
        match self.slots.get_mut(&index) {
            Some(mut slot) => {
                slot.attempts += 1;
                slot.attempts
            }
            None => 0,
        }
    }

    pub fn attempts(&self, index: usize) -> u32 {
        self.slots.get(&index).map(|slot| slot.attempts).unwrap_or(0)
    }

    /// Ordered copy of the table, emitted with every progress event.
    pub fn snapshot(&self) -> Vec<ChunkSlot> {
        (0..self.num_chunks())
            .filter_map(|index| self.get(index))
            .collect()
    }
}
