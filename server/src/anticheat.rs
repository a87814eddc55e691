//! Movement validation run on every position update.

use shared::Chunk;

/// Chunks with a coordinate closer to zero than this lie outside the world.
pub const WORLD_BORDER: i64 = 2;

/// Largest per-axis chunk step allowed between two position updates.
pub const MAX_CHUNK_STEP: i64 = 1;

pub const JUMP_REASON: &str = "[ANTICHEAT] Traveled distance too large";
pub const BORDER_REASON: &str = "[ANTICHEAT] Out of world border";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    JumpViolation,
    BorderViolation,
}

impl Verdict {
    /// Player-visible disconnect reason for a violation.
    pub fn reason(self) -> Option<&'static str> {
        match self {
            Verdict::Ok => None,
            Verdict::JumpViolation => Some(JUMP_REASON),
            Verdict::BorderViolation => Some(BORDER_REASON),
        }
    }
}

/// Classifies a move from `previous` to `next`.
///
/// Rules apply in order: no previous chunk, same chunk, step too large,
/// inside the border band. Only an `Ok` verdict may advance the recorded chunk.
pub fn classify(previous: Option<Chunk>, next: Chunk) -> Verdict {
    let Some(previous) = previous else {
        return Verdict::Ok;
    };
    if previous == next {
        return Verdict::Ok;
    }
    if (next.x - previous.x).abs() > MAX_CHUNK_STEP || (next.y - previous.y).abs() > MAX_CHUNK_STEP
    {
        return Verdict::JumpViolation;
    }
    if next.x.abs() < WORLD_BORDER || next.y.abs() < WORLD_BORDER {
        return Verdict::BorderViolation;
    }
    Verdict::Ok
}
