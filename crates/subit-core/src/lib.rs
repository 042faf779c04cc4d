//! # Subit Core: single-flight media transcription
//!
//! One upload at a time goes through: duration probe → decoder process → fixed-length
//! audio windows → recognizer → ordered transcript segments.
//!
//! ```text
//!              start_task / cancel_and_join / reset_all
//! HTTP, CLI ─────────────────────► TaskSupervisor ◄──── append_segment / complete_task
//!                                        │                      ▲
//!                                        │ Janitor              │
//!                                        ▼                      │
//!                              uploads + scratch files     TaskWorker (thread)
//!                                                               │
//!                                       ffmpeg ─► ChunkStreamer ┴─► Recognizer
//! ```

pub mod config;
pub mod error;
pub mod janitor;
pub mod probe;
pub mod streamer;
pub mod supervisor;
pub mod transcript;
pub mod worker;

pub use config::SubitConfig;
pub use error::{JobError, JobResult};
pub use janitor::{CleanupReport, Janitor, JanitorConfig};
pub use probe::{estimate_chunk_count, DurationProbe, FfprobeProbe};
pub use streamer::{ChunkStream, ChunkStreamer, DecodeCommand, FfmpegDecoder};
pub use supervisor::{
    ProgressSnapshot, StagedSource, TaskStatus, TaskSupervisor, TaskToken, WorkerHandle,
};
pub use transcript::TranscriptSegment;
pub use worker::TaskWorker;
