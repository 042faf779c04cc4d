//! Service configuration loaded from file and environment.
//!
//! Precedence: env `SUBIT__*` > file at `SUBIT_CONFIG` (default `config/subit.toml`) > defaults.
//! Nested keys use `__`, e.g. `SUBIT__RECOGNIZER__BACKEND=http`.

use crate::janitor::JanitorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use subit_voice::RecognizerConfig;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_chunk_duration_secs() -> u32 {
    10
}

fn default_max_content_length() -> u64 {
    500 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    [".mp4", ".mov", ".avi", ".mkv", ".webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_cleanup_retries() -> u32 {
    3
}

fn default_cleanup_backoff_ms() -> u64 {
    200
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

/// Subit configuration.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | host / port | 0.0.0.0 / 5000 | HTTP bind address. |
/// | upload_dir / temp_dir | ./uploads / ./temp | Staged uploads and scratch files. |
/// | sample_rate | 16000 | Decoder output rate (Hz). |
/// | chunk_duration_secs | 10 | Window length fed to the recognizer. |
/// | max_content_length | 500 MB | Upload body limit. |
/// | join_timeout_ms | 10000 | Bound on cancel-and-join before replacing a task. |
/// | read_timeout_ms | 100 | Decoder read poll; bounds cancellation latency. |
/// | cleanup_retries / cleanup_backoff_ms | 3 / 200 | Janitor retry policy for files still in use. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubitConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_chunk_duration_secs")]
    pub chunk_duration_secs: u32,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: u64,
    /// Lowercase, dot-prefixed (".mp4").
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Advertised to clients; the server does not poll.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_cleanup_retries")]
    pub cleanup_retries: u32,
    #[serde(default = "default_cleanup_backoff_ms")]
    pub cleanup_backoff_ms: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
}

impl Default for SubitConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            temp_dir: default_temp_dir(),
            sample_rate: default_sample_rate(),
            chunk_duration_secs: default_chunk_duration_secs(),
            max_content_length: default_max_content_length(),
            allowed_extensions: default_allowed_extensions(),
            poll_interval_ms: default_poll_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            cleanup_retries: default_cleanup_retries(),
            cleanup_backoff_ms: default_cleanup_backoff_ms(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            recognizer: RecognizerConfig::default(),
        }
    }
}

impl SubitConfig {
    /// Load config from file and environment. Missing keys fall back to the defaults above.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SUBIT_CONFIG").unwrap_or_else(|_| "config/subit".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with an explicit file path (extension optional, as accepted by `config::File::with_name`).
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let name = path.to_string_lossy();
        config::Config::builder()
            .add_source(config::File::with_name(&name).required(false))
            .add_source(
                config::Environment::with_prefix("SUBIT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_extensions"),
            )
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    /// Reject values that would make windows empty or the read loop spin.
    pub fn validated(self) -> Result<Self, config::ConfigError> {
        if self.chunk_duration_secs == 0 {
            return Err(config::ConfigError::Message(
                "chunk_duration_secs must be at least 1".to_string(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(config::ConfigError::Message(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "read_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(self)
    }

    /// Create upload and scratch directories if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when `filename` ends in one of `allowed_extensions` (case-insensitive).
    pub fn is_allowed_file(&self, filename: &str) -> bool {
        let ext = match Path::new(filename).extension().and_then(|e| e.to_str()) {
            Some(e) => format!(".{}", e.to_lowercase()),
            None => return false,
        };
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&ext))
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.chunk_duration_secs))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn janitor_config(&self) -> JanitorConfig {
        JanitorConfig {
            retries: self.cleanup_retries,
            backoff: Duration::from_millis(self.cleanup_backoff_ms),
        }
    }
}
