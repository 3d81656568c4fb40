//! Audio capture, end-of-turn detection and playback for duet.
//!
//! Device access sits behind two small traits, [`AudioInput`] and
//! [`AudioOutput`], with cpal and rodio implementations. Everything else in
//! this crate is device independent.

mod capture;
mod detector;
mod mic;
mod playback;
mod speaker;

pub use capture::{
    AudioBlob, AudioChunk, AudioFormat, AudioInput, CaptureError, CaptureEvent, CaptureSession,
    CaptureSink, LevelTap, MicrophoneGuard, RecordingState, StopReason,
};
pub use detector::{MIN_DB, SilenceDetector, SilenceWatch, amplitude_db};
pub use mic::CpalInput;
pub use playback::{AudioOutput, PlaybackController, PlaybackError, PlaybackItem, Playing, Progress};
pub use speaker::RodioOutput;
