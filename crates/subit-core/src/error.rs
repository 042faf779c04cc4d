//! Errors surfaced by a transcription job.

use subit_voice::VoiceError;
use thiserror::Error;

/// Result type alias for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Why a job stopped early. `Cancelled` is expected and not a fault.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("cancelled")]
    Cancelled,

    #[error("failed to start decoder `{program}`: {source}")]
    DecoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid stream parameters: {0}")]
    InvalidStream(String),

    #[error("recognition failed: {0}")]
    Recognition(#[from] VoiceError),
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}
