//! Module for managing a single recording. There can only be one active
//! recording per session and the session owns every chunk captured for it.
//!
//! ## Format notes
//!
//! Chunks are 16-bit little-endian PCM in the device's native rate and
//! channel count. The blob handed to the channel is the exact concatenation
//! of the chunks; it is only wrapped in a WAV container when it leaves the
//! process.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use hound::WavWriter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The platform refused access to the microphone
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    /// No recording device available
    #[error("no input device available")]
    NoInputDevice,
    /// Sample format not supported
    #[error("sample format not supported: {0}")]
    SampleFormatNotSupported(String),
    /// Any other device failure
    #[error("input device error: {0}")]
    Device(String),
    /// Build stream error
    #[error(transparent)]
    BuildStream(#[from] cpal::BuildStreamError),
    /// Play stream error
    #[error(transparent)]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("a recording is already in progress")]
    AlreadyStarted,
    #[error("no recording in progress")]
    NotRecording,
    /// WAV encoding error
    #[error(transparent)]
    Wav(#[from] hound::Error),
}

type Result<T> = std::result::Result<T, CaptureError>;

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user asked to stop
    Manual,
    /// Continuous silence reached the configured duration
    Silence,
    /// The safety timer fired
    MaxDuration,
    /// The input stream reported an error or went away
    InputFailed,
    /// The recording was torn down without being submitted
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    const BYTES_PER_SAMPLE: usize = 2;

    fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * Self::BYTES_PER_SAMPLE
    }
}

/// One fragment of captured audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// The finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    format: AudioFormat,
    data: Vec<u8>,
}

impl AudioBlob {
    pub fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of individual samples across all channels.
    pub fn samples(&self) -> usize {
        self.data.len() / AudioFormat::BYTES_PER_SAMPLE
    }

    pub fn duration(&self) -> Duration {
        match self.format.bytes_per_second() {
            0 => Duration::ZERO,
            rate => Duration::from_secs_f64(self.data.len() as f64 / rate as f64),
        }
    }

    /// Wrap the PCM data in a WAV container.
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(self.data.len() + 64));
        {
            let mut writer = WavWriter::new(&mut cursor, spec)?;
            for pair in self.data.chunks_exact(AudioFormat::BYTES_PER_SAMPLE) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

/// The most recent time-domain buffer seen by the input driver. Read by the
/// silence detector on every sampling tick.
#[derive(Debug, Clone, Default)]
pub struct LevelTap {
    latest: Arc<Mutex<Vec<f32>>>,
}

impl LevelTap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current buffer. Skips the update rather than blocking if
    /// a reader holds the lock, since this runs on the audio thread.
    pub fn update(&self, samples: &[f32]) {
        if let Some(mut guard) = self.latest.try_lock() {
            guard.clear();
            guard.extend_from_slice(samples);
        }
    }

    pub fn snapshot(&self) -> Vec<f32> {
        self.latest.lock().clone()
    }
}

#[derive(Debug)]
enum Feed {
    Chunk(Vec<u8>),
    Failed(String),
}

/// Handle given to an input driver. Cheap to clone and safe to move onto the
/// driver's callback thread.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<Feed>,
    level: LevelTap,
}

impl CaptureSink {
    /// Push normalized samples (`-1.0..=1.0`). Returns false once the owning
    /// session has stopped listening.
    pub fn push(&self, samples: &[f32]) -> bool {
        self.level.update(samples);
        let mut bytes = Vec::with_capacity(samples.len() * AudioFormat::BYTES_PER_SAMPLE);
        for &sample in samples {
            let sample = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.tx.send(Feed::Chunk(bytes)).is_ok()
    }

    /// Report a fatal stream error.
    pub fn fail(&self, reason: impl Into<String>) {
        self.tx.send(Feed::Failed(reason.into())).ok();
    }
}

/// Scoped ownership of a live input stream. The release action runs exactly
/// once, on [`MicrophoneGuard::release`] or on drop.
pub struct MicrophoneGuard {
    format: AudioFormat,
    release: Option<Box<dyn FnOnce()>>,
}

impl MicrophoneGuard {
    pub fn new(format: AudioFormat, release: impl FnOnce() + 'static) -> Self {
        Self {
            format,
            release: Some(Box::new(release)),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!("Microphone released");
        }
    }
}

impl Drop for MicrophoneGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for MicrophoneGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneGuard")
            .field("format", &self.format)
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// A microphone driver.
pub trait AudioInput {
    /// Open the microphone and start delivering samples to `sink`.
    fn acquire(&self, sink: CaptureSink) -> Result<MicrophoneGuard>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopped,
}

/// What woke the session up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A chunk of this many bytes was appended
    Chunk(usize),
    /// The driver reported an error
    Failed(String),
    /// The driver stopped delivering without an error
    InputClosed,
}

/// One user turn of speech capture.
#[derive(Debug)]
pub struct CaptureSession {
    state: RecordingState,
    started_at: Option<Instant>,
    format: Option<AudioFormat>,
    chunks: Vec<AudioChunk>,
    next_index: u64,
    microphone: Option<MicrophoneGuard>,
    feed: Option<mpsc::UnboundedReceiver<Feed>>,
    level: LevelTap,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: RecordingState::Idle,
            started_at: None,
            format: None,
            chunks: Vec::new(),
            next_index: 0,
            microphone: None,
            feed: None,
            level: LevelTap::new(),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// The live level buffer for this session's input.
    pub fn level(&self) -> LevelTap {
        self.level.clone()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn chunks(&self) -> &[AudioChunk] {
        &self.chunks
    }

    /// Acquire the microphone and begin accumulating chunks. On error the
    /// session stays `Idle` and nothing is held.
    pub fn start(&mut self, input: &dyn AudioInput) -> Result<()> {
        if self.state != RecordingState::Idle {
            return Err(CaptureError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = CaptureSink {
            tx,
            level: self.level.clone(),
        };
        let microphone = input.acquire(sink)?;

        info!(format = ?microphone.format(), "Recording started");
        self.format = Some(microphone.format());
        self.microphone = Some(microphone);
        self.feed = Some(rx);
        self.started_at = Some(Instant::now());
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Append a chunk. Refused unless the session is recording.
    pub fn append(&mut self, data: Vec<u8>) -> bool {
        if self.state != RecordingState::Recording {
            warn!(
                state = ?self.state,
                bytes = data.len(),
                "Dropping audio chunk outside of a recording"
            );
            return false;
        }
        self.chunks.push(AudioChunk {
            index: self.next_index,
            data,
        });
        self.next_index += 1;
        true
    }

    /// Wait for the driver to deliver something. Chunks are appended before
    /// this returns. Pending forever when not recording.
    pub async fn next_event(&mut self) -> CaptureEvent {
        let Some(feed) = self.feed.as_mut() else {
            return std::future::pending().await;
        };
        match feed.recv().await {
            Some(Feed::Chunk(data)) => {
                let len = data.len();
                self.append(data);
                CaptureEvent::Chunk(len)
            }
            Some(Feed::Failed(reason)) => CaptureEvent::Failed(reason),
            None => {
                self.feed = None;
                CaptureEvent::InputClosed
            }
        }
    }

    /// Release the microphone and finalize the recording into a blob. The
    /// microphone is released before anything else happens.
    pub fn stop(&mut self) -> Result<AudioBlob> {
        if self.state != RecordingState::Recording {
            return Err(CaptureError::NotRecording);
        }

        if let Some(microphone) = self.microphone.take() {
            microphone.release();
        }

        // Anything still queued was captured while recording.
        if let Some(mut feed) = self.feed.take() {
            feed.close();
            while let Ok(message) = feed.try_recv() {
                if let Feed::Chunk(data) = message {
                    self.append(data);
                }
            }
        }

        self.state = RecordingState::Stopped;

        let chunks = std::mem::take(&mut self.chunks);
        let total = chunks.iter().map(|c| c.data.len()).sum();
        let mut data = Vec::with_capacity(total);
        for chunk in &chunks {
            data.extend_from_slice(&chunk.data);
        }

        let format = self.format.unwrap_or(AudioFormat {
            sample_rate: 0,
            channels: 1,
        });
        let blob = AudioBlob::new(format, data);
        info!(
            chunks = chunks.len(),
            bytes = blob.len(),
            length_seconds = blob.duration().as_secs_f64(),
            "Recording finished"
        );
        Ok(blob)
    }
}
