//! Streaming chunk producer: media file → external decoder → fixed-duration `AudioWindow`s.
//!
//! One decoder process per `stream` call writes raw little-endian f32 mono PCM to
//! stdout. A reader thread forwards stdout in blocks over a bounded channel, so the
//! consumer waits at most `read_timeout` per poll and re-checks the cancellation
//! predicate even while the decoder is stalled. Memory stays bounded by one window
//! plus the channel depth, whatever the length of the input.
//!
//! The decoder is terminated and reaped on every exit path (end of stream,
//! cancellation, error, or the `ChunkStream` being dropped half-way).

use crate::error::{JobError, JobResult};
use std::io::{self, BufRead, BufReader, Read};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use subit_voice::AudioWindow;
use tracing::{debug, info, warn};

/// f32 PCM.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Size of one stdout read.
const READ_BLOCK: usize = 64 * 1024;
/// Blocks buffered between reader thread and consumer.
const PIPE_DEPTH: usize = 8;
/// Bytes of decoder stderr kept for error messages.
const STDERR_TAIL: usize = 4 * 1024;
/// How long a decoder gets to exit after SIGTERM (or after closing stdout) before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Builds the decoder invocation for one input file.
pub trait DecodeCommand: Send + Sync {
    /// Command that writes raw little-endian f32 mono PCM at `sample_rate` to stdout.
    fn command(&self, source: &Path, sample_rate: u32) -> Command;
}

/// ffmpeg as decoder: audio only, `pcm_f32le`, mono, resampled to the target rate.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    program: PathBuf,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl DecodeCommand for FfmpegDecoder {
    fn command(&self, source: &Path, sample_rate: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-nostdin", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(source)
            .args(["-vn", "-sn", "-dn", "-acodec", "pcm_f32le", "-ar"])
            .arg(sample_rate.to_string())
            .args(["-ac", "1", "-f", "f32le", "-"]);
        cmd
    }
}

/// Produces lazy, finite, non-restartable sequences of audio windows.
#[derive(Clone)]
pub struct ChunkStreamer {
    decoder: Arc<dyn DecodeCommand>,
    read_timeout: Duration,
}

impl ChunkStreamer {
    pub fn new(decoder: Arc<dyn DecodeCommand>, read_timeout: Duration) -> Self {
        Self {
            decoder,
            read_timeout,
        }
    }

    /// Streamer backed by ffmpeg at `program`.
    pub fn ffmpeg(program: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        Self::new(Arc::new(FfmpegDecoder::new(program)), read_timeout)
    }

    /// Start decoding `source` and return the window sequence.
    ///
    /// Items are `Err(JobError::Cancelled)` as soon as `is_cancelled` returns true,
    /// `Err(JobError::Decode)` when the decoder fails on its own; either ends the sequence.
    /// The final window may be shorter than `chunk_duration`.
    pub fn stream<F>(
        &self,
        source: &Path,
        sample_rate: u32,
        chunk_duration: Duration,
        is_cancelled: F,
    ) -> JobResult<ChunkStream<F>>
    where
        F: Fn() -> bool,
    {
        if is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if sample_rate == 0 || chunk_duration.is_zero() || self.read_timeout.is_zero() {
            return Err(JobError::InvalidStream(format!(
                "sample rate {} Hz, window {:?}, read timeout {:?}",
                sample_rate, chunk_duration, self.read_timeout
            )));
        }
        let chunk_secs = chunk_duration.as_secs_f64();
        let window_samples = ((chunk_secs * f64::from(sample_rate)).round() as usize).max(1);

        let mut cmd = self.decoder.command(source, sample_rate);
        let program = cmd.get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|source| JobError::DecoderSpawn {
            program: program.clone(),
            source,
        })?;
        let mut process = DecoderProcess::new(child);
        info!(
            target: "subit::streamer",
            "decoder `{}` started (pid {}) for {}",
            program,
            process.id(),
            source.display()
        );

        let stdout = process
            .take_stdout()
            .ok_or_else(|| JobError::Decode("decoder stdout unavailable".to_string()))?;
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_closed = match process.take_stderr() {
            Some(stderr) => {
                let (done_tx, done_rx) = mpsc::channel::<()>();
                spawn_stderr_collector(stderr, Arc::clone(&stderr_tail), done_tx)
                    .map_err(|e| JobError::Decode(format!("stderr reader: {}", e)))?;
                Some(done_rx)
            }
            None => None,
        };
        let (tx, rx) = mpsc::sync_channel(PIPE_DEPTH);
        spawn_stdout_reader(stdout, tx)
            .map_err(|e| JobError::Decode(format!("stdout reader: {}", e)))?;

        Ok(ChunkStream {
            process: Some(process),
            rx,
            stderr_tail,
            stderr_closed,
            buffer: Vec::with_capacity(window_samples * BYTES_PER_SAMPLE + READ_BLOCK),
            window_bytes: window_samples * BYTES_PER_SAMPLE,
            sample_rate,
            chunk_secs,
            chunk_index: 0,
            read_timeout: self.read_timeout,
            is_cancelled,
            eof: false,
            finished: false,
        })
    }
}

/// Iterator over the windows of one decode. Dropping it stops the decoder.
pub struct ChunkStream<F> {
    process: Option<DecoderProcess>,
    rx: Receiver<io::Result<Vec<u8>>>,
    stderr_tail: Arc<Mutex<String>>,
    /// Disconnects once the stderr collector has seen EOF.
    stderr_closed: Option<Receiver<()>>,
    buffer: Vec<u8>,
    window_bytes: usize,
    sample_rate: u32,
    chunk_secs: f64,
    chunk_index: usize,
    read_timeout: Duration,
    is_cancelled: F,
    eof: bool,
    finished: bool,
}

impl<F> ChunkStream<F>
where
    F: Fn() -> bool,
{
    fn take_window(&mut self, nbytes: usize) -> AudioWindow {
        let samples: Vec<f32> = self.buffer[..nbytes]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.buffer.drain(..nbytes);

        let index = self.chunk_index;
        let start_time = index as f64 * self.chunk_secs;
        let end_time = if nbytes == self.window_bytes {
            (index + 1) as f64 * self.chunk_secs
        } else {
            start_time + samples.len() as f64 / f64::from(self.sample_rate)
        };
        self.chunk_index += 1;
        debug!(
            target: "subit::streamer",
            "window {} [{:.2}s, {:.2}s) {} samples",
            index,
            start_time,
            end_time,
            samples.len()
        );
        AudioWindow {
            index,
            samples,
            sample_rate: self.sample_rate,
            start_time,
            end_time,
        }
    }

    /// Stop the decoder first, then hand back the error that ends the sequence.
    fn fail(&mut self, err: JobError) -> JobResult<AudioWindow> {
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        self.finished = true;
        match &err {
            JobError::Cancelled => info!(
                target: "subit::streamer",
                "streaming cancelled after {} window(s)",
                self.chunk_index
            ),
            other => warn!(target: "subit::streamer", "streaming failed: {}", other),
        }
        Err(err)
    }

    /// End of stdout: reap the decoder and report a failure exit, if any.
    fn finish(&mut self) -> Option<JobResult<AudioWindow>> {
        self.finished = true;
        let status = self.process.take().and_then(|mut p| p.wait_for_exit());
        match status {
            Some(status) if !status.success() => {
                if (self.is_cancelled)() {
                    info!(target: "subit::streamer", "decoder stopped by cancellation");
                    return Some(Err(JobError::Cancelled));
                }
                if let Some(closed) = self.stderr_closed.take() {
                    let _ = closed.recv_timeout(EXIT_GRACE);
                }
                let tail = self
                    .stderr_tail
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .trim()
                    .to_string();
                let err = JobError::Decode(format!("decoder exited with {}: {}", status, tail));
                warn!(target: "subit::streamer", "{}", err);
                Some(Err(err))
            }
            _ => {
                info!(
                    target: "subit::streamer",
                    "end of stream after {} window(s)",
                    self.chunk_index
                );
                None
            }
        }
    }
}

impl<F> Iterator for ChunkStream<F>
where
    F: Fn() -> bool,
{
    type Item = JobResult<AudioWindow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if (self.is_cancelled)() {
                return Some(self.fail(JobError::Cancelled));
            }
            if self.buffer.len() >= self.window_bytes {
                return Some(Ok(self.take_window(self.window_bytes)));
            }
            if self.eof {
                // Flush the partial tail once; a trailing fragment of a sample is dropped.
                let usable = self.buffer.len() - self.buffer.len() % BYTES_PER_SAMPLE;
                if usable > 0 {
                    let window = self.take_window(usable);
                    self.buffer.clear();
                    return Some(Ok(window));
                }
                self.buffer.clear();
                return self.finish();
            }
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(Ok(block)) => self.buffer.extend_from_slice(&block),
                Ok(Err(e)) => {
                    // A torn pipe caused by cancelling is not a fault.
                    let err = if (self.is_cancelled)() {
                        JobError::Cancelled
                    } else {
                        JobError::Decode(format!("reading decoder output: {}", e))
                    };
                    return Some(self.fail(err));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => self.eof = true,
            }
        }
    }
}

impl<F> FusedIterator for ChunkStream<F> where F: Fn() -> bool {}

impl<F> Drop for ChunkStream<F> {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }
}

/// Owned decoder child. Terminated and reaped on drop unless already reaped.
struct DecoderProcess {
    child: Child,
    reaped: bool,
}

impl DecoderProcess {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Give a decoder that closed stdout `EXIT_GRACE` to exit on its own.
    /// Returns its exit status, or `None` if it had to be terminated.
    fn wait_for_exit(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.poll_exit(EXIT_GRACE) {
            self.reaped = true;
            return Some(status);
        }
        self.terminate();
        None
    }

    /// SIGTERM (unix), wait up to `EXIT_GRACE`, then kill. Always reaps.
    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let pid = self.child.id();
        #[cfg(unix)]
        {
            // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        if self.poll_exit(EXIT_GRACE).is_some() {
            debug!(target: "subit::streamer", "decoder (pid {}) terminated", pid);
            return;
        }
        warn!(target: "subit::streamer", "decoder (pid {}) ignored SIGTERM, killing", pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn poll_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => return None,
                Err(e) => {
                    debug!(target: "subit::streamer", "try_wait failed: {}", e);
                    return None;
                }
            }
        }
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Forward stdout in blocks until EOF, a read error, or the consumer going away.
fn spawn_stdout_reader(
    mut stdout: ChildStdout,
    tx: SyncSender<io::Result<Vec<u8>>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("subit-decode-stdout".to_string())
        .spawn(move || {
            let mut block = vec![0u8; READ_BLOCK];
            loop {
                match stdout.read(&mut block) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(block[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })
}

/// Drain stderr so the decoder never blocks on a full pipe; keep the last few KiB.
fn spawn_stderr_collector(
    stderr: ChildStderr,
    tail: Arc<Mutex<String>>,
    done: mpsc::Sender<()>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("subit-decode-stderr".to_string())
        .spawn(move || {
            let _done = done;
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            // Read to EOF whatever the content; closing early would SIGPIPE the decoder.
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
                let text = String::from_utf8_lossy(&line);
                let mut t = tail.lock().unwrap_or_else(PoisonError::into_inner);
                t.push_str(text.trim_end_matches(['\r', '\n']));
                t.push('\n');
                if t.len() > STDERR_TAIL {
                    let mut cut = t.len() - STDERR_TAIL;
                    while !t.is_char_boundary(cut) {
                        cut += 1;
                    }
                    t.drain(..cut);
                }
            }
        })
}
