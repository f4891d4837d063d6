//! Chunk payload validation applied on every conversion and write batch.

use tracing::warn;

use super::MAX_CHUNK_SIZE;


/// Chunk coordinates further than this from the origin are rejected.
pub const MAX_COORD: i32 = 30_000_000;

/// Payloads smaller than this raise a suspicious-size warning.
const SUSPICIOUS_MIN_SIZE: usize = 64;
/// Payloads larger than this raise a suspicious-size warning.
const SUSPICIOUS_MAX_SIZE: usize = 512 * 1024;

/// Highest NBT tag id a chunk payload may start with.
const MAX_NBT_TAG: u8 = 0x0C;


/// Per-batch validator for chunk payloads. Duplicate detection is scoped to
/// the batch: call [`reset`] between region files.
///
/// [`reset`]: ChunkValidator::reset
#[derive(Debug, Default)]
pub struct ChunkValidator {
    seen: std::collections::HashSet<(i32, i32)>,
    warnings: u64,
}

impl ChunkValidator {

    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one chunk of the current batch, recording its coordinates
    /// for duplicate detection. Suspicious sizes are logged but accepted.
    pub fn validate(&mut self, cx: i32, cz: i32, payload: &[u8]) -> Result<(), ValidationError> {

        if cx.unsigned_abs() > MAX_COORD as u32 || cz.unsigned_abs() > MAX_COORD as u32 {
            return Err(ValidationError::CoordinateOutOfRange { cx, cz });
        }

        if payload.is_empty() {
            return Err(ValidationError::EmptyPayload { cx, cz });
        }

        if payload.len() > MAX_CHUNK_SIZE {
            return Err(ValidationError::OversizedPayload { cx, cz, len: payload.len() });
        }

        let tag = payload[0];
        if tag > MAX_NBT_TAG {
            return Err(ValidationError::InvalidNbtTag { cx, cz, tag });
        }

        if !self.seen.insert((cx, cz)) {
            return Err(ValidationError::DuplicateChunk { cx, cz });
        }

        if payload.len() < SUSPICIOUS_MIN_SIZE || payload.len() > SUSPICIOUS_MAX_SIZE {
            self.warnings += 1;
            warn!("suspicious payload size {} for chunk {cx}/{cz}", payload.len());
        }

        Ok(())

    }

    /// Forget the duplicate set, starting a new batch.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings
    }

}


#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("chunk {cx}/{cz} has an empty payload")]
    EmptyPayload { cx: i32, cz: i32 },
    #[error("chunk {cx}/{cz} payload of {len} bytes exceeds the per-chunk cap")]
    OversizedPayload { cx: i32, cz: i32, len: usize },
    #[error("chunk coordinates {cx}/{cz} are out of range")]
    CoordinateOutOfRange { cx: i32, cz: i32 },
    #[error("chunk {cx}/{cz} appears twice in the batch")]
    DuplicateChunk { cx: i32, cz: i32 },
    #[error("chunk {cx}/{cz} starts with {tag:#04x} which is not an NBT tag")]
    InvalidNbtTag { cx: i32, cz: i32, tag: u8 },
}
