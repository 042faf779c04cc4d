//! Error types for the recognizer boundary

use thiserror::Error;

/// Result type alias for recognizer operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors raised while turning an audio window into text
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Recognizer error: {0}")]
    Recognizer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WAV encoding error: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Http(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Encode(err.to_string())
    }
}
