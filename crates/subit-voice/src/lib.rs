//! # Subit Voice: recognizer boundary
//!
//! Defines the `AudioWindow` handed to recognition and the `Recognizer` trait
//! every backend implements. Backends normalize their native output into one
//! `Recognition { text }` here, so the transcription core never deals with
//! backend-specific result shapes.
//!
//! ```text
//! AudioWindow (mono f32 @ 16 kHz) ──► Recognizer ──► Recognition { text }
//!                                      ├─ PlaceholderRecognizer
//!                                      ├─ HttpRecognizer   (OpenAI-compatible)
//!                                      └─ WhisperRecognizer (feature = "whisper")
//! ```

pub mod error;
pub mod recognizer;
pub mod wav;
pub mod window;

pub use error::{VoiceError, VoiceResult};
pub use recognizer::{
    build_recognizer, HttpRecognizer, PlaceholderRecognizer, Recognition, Recognizer,
    RecognizerBackend, RecognizerConfig, RECOGNIZER_SAMPLE_RATE,
};
#[cfg(feature = "whisper")]
pub use recognizer::WhisperRecognizer;
pub use wav::pcm_f32_to_wav;
pub use window::AudioWindow;
