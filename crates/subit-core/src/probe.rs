//! Media duration probing (metadata only, no decode) and the chunk-count estimate.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::warn;

/// Black-box duration query. Returns seconds, or `0.0` when the duration is unknown.
pub trait DurationProbe: Send + Sync {
    fn probe(&self, source: &Path) -> f64;
}

/// `ffprobe -show_entries format=duration` probe.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl DurationProbe for FfprobeProbe {
    fn probe(&self, source: &Path) -> f64 {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(source)
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(out) if out.status.success() => {
                parse_duration(&String::from_utf8_lossy(&out.stdout)).unwrap_or_else(|| {
                    warn!(target: "subit::probe", "no duration reported for {}", source.display());
                    0.0
                })
            }
            Ok(out) => {
                warn!(
                    target: "subit::probe",
                    "ffprobe failed for {} ({}): {}",
                    source.display(),
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                0.0
            }
            Err(e) => {
                warn!(target: "subit::probe", "failed to run {}: {}", self.program.display(), e);
                0.0
            }
        }
    }
}

/// Parse ffprobe's bare duration line. Rejects "N/A", negatives and non-finite values.
fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Windows a stream of `duration` seconds will produce at `chunk_secs` per window:
/// one per full window plus one for a non-empty tail. `0` for unknown/zero duration.
///
/// Matches `floor(duration / chunk) + 1` except at exact multiples, where no tail exists.
pub fn estimate_chunk_count(duration: f64, chunk_secs: f64) -> usize {
    if !duration.is_finite() || duration <= 0.0 || !chunk_secs.is_finite() || chunk_secs <= 0.0 {
        return 0;
    }
    let full = (duration / chunk_secs).floor();
    let tail = duration - full * chunk_secs;
    // Sub-millisecond remainders are float noise, not a real tail.
    if tail > 1e-3 {
        full as usize + 1
    } else {
        full as usize
    }
}
