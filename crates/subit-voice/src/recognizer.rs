//! **Recognizer**: convert one `AudioWindow` of mono PCM into text.
//!
//! Every backend normalizes its native result into a single [`Recognition`] at
//! this boundary, so the worker never inspects backend-specific shapes.
//! Calls are synchronous and may take seconds; the worker runs them on its own
//! thread.

use crate::error::{VoiceError, VoiceResult};
use crate::wav::pcm_f32_to_wav;
use crate::window::AudioWindow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sample rate every local backend expects.
pub const RECOGNIZER_SAMPLE_RATE: u32 = 16000;

/// The one result shape a recognizer produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recognition {
    /// Recognized text; empty when nothing was heard (silence).
    pub text: String,
}

impl Recognition {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Backend converting one audio window to text. Not assumed re-entrant.
pub trait Recognizer: Send + Sync {
    /// Recognize one window. Return an empty `Recognition` when nothing is detected.
    fn recognize(&self, window: &AudioWindow) -> VoiceResult<Recognition>;

    /// Short backend label for logs.
    fn name(&self) -> &'static str;
}

/// Which backend `build_recognizer` constructs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognizerBackend {
    #[default]
    Placeholder,
    Http,
    Whisper,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "whisper-1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Recognizer selection and backend settings (the `[recognizer]` config table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    #[serde(default)]
    pub backend: RecognizerBackend,
    /// Base URL of an OpenAI-compatible API, without trailing slash.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Bearer key. Falls back to `STT_API_KEY` / `OPENAI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// ISO-639-1 hint passed to the backend; `None` lets it auto-detect.
    #[serde(default)]
    pub language: Option<String>,
    /// ggml model file for the `whisper` backend.
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            backend: RecognizerBackend::default(),
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            language: None,
            model_path: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Placeholder recognizer: returns a fixed string. Use for dry runs and tests.
#[derive(Debug, Default)]
pub struct PlaceholderRecognizer {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl Recognizer for PlaceholderRecognizer {
    fn recognize(&self, window: &AudioWindow) -> VoiceResult<Recognition> {
        if let Some(ref r) = self.response {
            return Ok(Recognition::new(r.clone()));
        }
        Ok(Recognition::new(format!(
            "[placeholder: {} samples, {:.1}s-{:.1}s]",
            window.samples.len(),
            window.start_time,
            window.end_time
        )))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// Remote recognizer: OpenAI-compatible `/audio/transcriptions` (OpenAI Whisper, local servers, etc.).
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpRecognizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        language: Option<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language,
            client,
        })
    }

    /// Build from config; the key may come from `STT_API_KEY` or `OPENAI_API_KEY`.
    pub fn from_config(config: &RecognizerConfig) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("STT_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                VoiceError::Config(
                    "http recognizer requires recognizer.api_key, STT_API_KEY, or OPENAI_API_KEY"
                        .to_string(),
                )
            })?;
        Self::new(
            config.api_url.clone(),
            api_key,
            config.model.clone(),
            config.language.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'))
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, window: &AudioWindow) -> VoiceResult<Recognition> {
        if window.is_empty() {
            return Ok(Recognition::default());
        }
        let wav = pcm_f32_to_wav(&window.samples, window.sample_rate)?;
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name(format!("window_{}.wav", window.index))
            .mime_str("audio/wav")?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }
        let res = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Recognizer(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res.json()?;
        Ok(recognition_from_json(&json))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Normalize an STT JSON reply. Accepts `{"text": ..}`, `[{"text": ..}, ..]` or a bare string.
fn recognition_from_json(json: &serde_json::Value) -> Recognition {
    let text = match json {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Array(items) => items
            .first()
            .and_then(|v| v.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or(""),
        other => other.get("text").and_then(|t| t.as_str()).unwrap_or(""),
    };
    Recognition::new(text.trim())
}

// -----------------------------------------------------------------------------
// Local Whisper recognizer (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_backend {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper: loads a ggml model once and runs inference on-device.
    /// Audio must be 16 kHz mono f32.
    pub struct WhisperRecognizer {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
        language: Option<String>,
    }

    impl WhisperRecognizer {
        pub fn new(model_path: &str, language: Option<String>) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Recognizer(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Recognizer(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
                language,
            })
        }
    }

    impl Recognizer for WhisperRecognizer {
        fn recognize(&self, window: &AudioWindow) -> VoiceResult<Recognition> {
            if window.is_empty() {
                return Ok(Recognition::default());
            }
            if window.sample_rate != RECOGNIZER_SAMPLE_RATE {
                return Err(VoiceError::Recognizer(format!(
                    "Whisper expects {} Hz; got {} Hz",
                    RECOGNIZER_SAMPLE_RATE, window.sample_rate
                )));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(self.language.as_deref());

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Recognizer(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(params, &window.samples)
                .map_err(|e| VoiceError::Recognizer(format!("Whisper inference failed: {}", e)))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ");
            Ok(Recognition::new(text.trim()))
        }

        fn name(&self) -> &'static str {
            "whisper"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_backend::WhisperRecognizer;

/// Build the configured backend once at startup (model loading happens here, not per window).
pub fn build_recognizer(config: &RecognizerConfig) -> VoiceResult<Arc<dyn Recognizer>> {
    let recognizer: Arc<dyn Recognizer> = match config.backend {
        RecognizerBackend::Placeholder => Arc::new(PlaceholderRecognizer::new()),
        RecognizerBackend::Http => Arc::new(HttpRecognizer::from_config(config)?),
        RecognizerBackend::Whisper => build_whisper(config)?,
    };
    info!(target: "subit::voice", "recognizer ready: {}", recognizer.name());
    Ok(recognizer)
}

#[cfg(feature = "whisper")]
fn build_whisper(config: &RecognizerConfig) -> VoiceResult<Arc<dyn Recognizer>> {
    let path = config
        .model_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| VoiceError::Config("recognizer.model_path is not set".to_string()))?;
    Ok(Arc::new(WhisperRecognizer::new(path, config.language.clone())?))
}

#[cfg(not(feature = "whisper"))]
fn build_whisper(_config: &RecognizerConfig) -> VoiceResult<Arc<dyn Recognizer>> {
    Err(VoiceError::Config(
        "whisper backend requested but subit-voice was built without the `whisper` feature"
            .to_string(),
    ))
}
