//! `AudioWindow`: one fixed-duration slice of decoded mono PCM.

/// A window of mono f32 samples plus its `[start_time, end_time)` span in seconds.
///
/// Produced by the chunk streamer, consumed (and dropped) by the worker right
/// after recognition. Never persisted.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    /// 0-based position of this window in the stream.
    pub index: usize,
    /// PCM samples (f32, -1.0..1.0).
    pub samples: Vec<f32>,
    /// Sample rate of `samples` (e.g. 16000).
    pub sample_rate: u32,
    /// Start of the window, seconds from the beginning of the media.
    pub start_time: f64,
    /// End of the window (exclusive). Shorter than a full window only for the tail.
    pub end_time: f64,
}

impl AudioWindow {
    /// Span covered by this window in seconds.
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_span() {
        let w = AudioWindow {
            index: 2,
            samples: vec![0.0; 80_000],
            sample_rate: 16000,
            start_time: 20.0,
            end_time: 25.0,
        };
        assert!((w.duration() - 5.0).abs() < 1e-9);
        assert!(!w.is_empty());
    }
}
