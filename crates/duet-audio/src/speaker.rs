//! rodio playback driver.

use std::io::Cursor;
use std::sync::Arc;

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tokio::sync::oneshot;
use tracing::info;

use crate::playback::{AudioOutput, PlaybackError, Playing};

/// The default output device. Each segment gets its own sink so completion
/// can be tracked per segment.
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl RodioOutput {
    pub fn new() -> Result<Self, PlaybackError> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| PlaybackError::NoOutputDevice(e.to_string()))?;
        info!("Audio output ready");
        Ok(Self {
            _stream: stream,
            handle,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, audio: &[u8]) -> Result<Playing, PlaybackError> {
        let source = Decoder::new(Cursor::new(audio.to_vec()))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let sink = Sink::try_new(&self.handle).map_err(|e| PlaybackError::Output(e.to_string()))?;
        sink.append(source);
        let sink = Arc::new(sink);

        let (tx, rx) = oneshot::channel();
        let waiter = Arc::clone(&sink);
        std::thread::Builder::new()
            .name("duet-playback".to_string())
            .spawn(move || {
                waiter.sleep_until_end();
                tx.send(()).ok();
            })
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        Ok(Playing::new(rx, move || sink.stop()))
    }
}
