//! Deterministic chunk planning.

use serde::{Deserialize, Serialize};

use crate::types::ChunkSpec;

/// Default floor below which backends reject parts: 100 KiB.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 100 * 1024;

/// Default ceiling on the number of parts per object.
pub const DEFAULT_MAX_CHUNK_COUNT: u32 = 10_000;

/// Backend limits that shape a chunk plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConstraints {
    /// Smallest accepted part, except for a whole-file single part.
    pub min_chunk_size: u64,
    /// Largest accepted part count.
    pub max_chunk_count: u32,
    /// Fixed part size to use when the backend (or caller) prefers one.
    pub preferred_chunk_size: Option<u64>,
    /// Largest accepted part, honoured unless it would overflow the count.
    pub max_chunk_size: Option<u64>,
    /// Candidate part sizes, smallest first.
    pub step_table: Vec<u64>,
}

impl Default for ChunkConstraints {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
            preferred_chunk_size: None,
            max_chunk_size: None,
            step_table: Vec::new(),
        }
    }
}

impl ChunkConstraints {
    /// Returns a copy with `preferred_chunk_size` replaced.
    pub fn with_preferred_chunk_size(mut self, size: Option<u64>) -> Self {
        if size.is_some() {
            self.preferred_chunk_size = size;
        }
        self
    }

    fn floor(&self) -> u64 {
        self.min_chunk_size.max(1)
    }

    fn count_for(total: u64, chunk_size: u64) -> u64 {
        total.div_ceil(chunk_size)
    }

    /// Picks the part size for `total` bytes.
    fn chunk_size_for(&self, total: u64) -> u64 {
        let floor = self.floor();
        let max_count = u64::from(self.max_chunk_count);

        let base = match self.preferred_chunk_size {
            Some(preferred) => preferred,
            None => self
                .step_table
                .iter()
                .copied()
                .find(|&step| step >= floor && Self::count_for(total, step) <= max_count)
                .unwrap_or(floor),
        };

        // Never below the floor, never more parts than allowed.
        let mut size = base.max(floor).max(total.div_ceil(max_count));
        if let Some(cap) = self.max_chunk_size
            && cap >= floor
            && size > cap
            && Self::count_for(total, cap) <= max_count
        {
            size = cap;
        }
        size
    }
}

/// Errors produced by [`plan`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("cannot plan chunks for an empty object")]
    ZeroSize,

    #[error("invalid chunk constraints: {0}")]
    InvalidConstraints(String),
}

/// Splits `total` bytes into an ordered, gapless list of chunks.
///
/// Pure and deterministic. Every chunk except a lone whole-file chunk is at
/// least `min_chunk_size`: a trailing remainder below the floor is folded
/// into the chunk before it.
pub fn plan(total: u64, constraints: &ChunkConstraints) -> Result<Vec<ChunkSpec>, PlanError> {
    if total == 0 {
        return Err(PlanError::ZeroSize);
    }
    if constraints.max_chunk_count == 0 {
        return Err(PlanError::InvalidConstraints(
            "max_chunk_count must be at least 1".into(),
        ));
    }
    if constraints.preferred_chunk_size == Some(0) {
        return Err(PlanError::InvalidConstraints(
            "preferred_chunk_size must be positive".into(),
        ));
    }

    let chunk_size = constraints.chunk_size_for(total);
    let floor = constraints.floor();

    let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut number = 1u32;
    while offset < total {
        let size = chunk_size.min(total - offset);
        chunks.push(ChunkSpec {
            number,
            offset,
            size,
        });
        offset += size;
        number += 1;
    }

    if chunks.len() > 1
        && let Some(last) = chunks.last().copied()
        && last.size < floor
    {
        chunks.pop();
        if let Some(prev) = chunks.last_mut() {
            prev.size += last.size;
        }
    }

    Ok(chunks)
}
