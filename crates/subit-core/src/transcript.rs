//! Transcript segment appended by the worker, one per audio window.

use serde::{Deserialize, Serialize};

/// A single recognized window (what, when). Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// 0-based, strictly increasing, no gaps.
    pub index: usize,
    /// Recognized text, trimmed. Empty for silence.
    pub text: String,
    /// Seconds from the start of the media.
    pub start_time: f64,
    /// Equals the next segment's `start_time`, except for the final (possibly shorter) one.
    pub end_time: f64,
}
