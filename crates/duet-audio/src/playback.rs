//! Sequential playback of synthesized agent audio.
//!
//! Segments are played strictly in arrival order with at most one active at
//! a time. The controller is the only component that moves the turn into and
//! out of `AgentSpeaking`.

use std::collections::VecDeque;

use duet_core::{ConversationTurn, TurnState};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no output device available: {0}")]
    NoOutputDevice(String),
    #[error("failed to decode audio segment: {0}")]
    Decode(String),
    #[error("audio output error: {0}")]
    Output(String),
}

/// One queued synthesized segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub speaker_id: String,
    pub audio: Vec<u8>,
    pub text: Option<String>,
}

/// An item on the output device. Completion is signalled through the
/// oneshot; a dropped sender counts as completion too. Dropping the
/// `Playing` stops the output.
pub struct Playing {
    finished: oneshot::Receiver<()>,
    stop: Option<Box<dyn FnOnce()>>,
}

impl Playing {
    pub fn new(finished: oneshot::Receiver<()>, stop: impl FnOnce() + 'static) -> Self {
        Self {
            finished,
            stop: Some(Box::new(stop)),
        }
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for Playing {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Playing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playing")
            .field("stopped", &self.stop.is_none())
            .finish()
    }
}

/// A playback device.
pub trait AudioOutput {
    /// Begin playing an encoded segment.
    fn play(&mut self, audio: &[u8]) -> Result<Playing, PlaybackError>;
}

/// What a call into the controller did.
#[derive(Debug, Default)]
pub struct Progress {
    /// Speaker of the segment that started playing
    pub started: Option<String>,
    /// Segments that could not be played and were skipped
    pub skipped: Vec<(String, PlaybackError)>,
    /// The queue ran dry after finishing or skipping at least one segment
    pub drained: bool,
}

#[derive(Debug)]
struct Active {
    item: PlaybackItem,
    playing: Playing,
}

pub struct PlaybackController {
    output: Box<dyn AudioOutput>,
    queue: VecDeque<PlaybackItem>,
    active: Option<Active>,
}

impl PlaybackController {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            queue: VecDeque::new(),
            active: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Items waiting behind the active one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn current(&self) -> Option<&PlaybackItem> {
        self.active.as_ref().map(|active| &active.item)
    }

    /// Queue a segment and start it if the floor is free.
    pub fn enqueue(&mut self, item: PlaybackItem, turn: &TurnState) -> Progress {
        debug!(
            speaker = %item.speaker_id,
            bytes = item.audio.len(),
            queued = self.queue.len(),
            "Segment queued"
        );
        self.queue.push_back(item);
        if self.active.is_some() {
            return Progress::default();
        }
        self.advance(turn, false)
    }

    /// Start queued segments that arrived while the floor was taken.
    pub fn resume(&mut self, turn: &TurnState) -> Progress {
        if self.active.is_some() || self.queue.is_empty() {
            return Progress::default();
        }
        self.advance(turn, false)
    }

    /// Resolves when the active segment finishes. Pending forever when
    /// nothing is playing.
    pub async fn finished(&mut self) {
        match self.active.as_mut() {
            Some(active) => {
                (&mut active.playing.finished).await.ok();
            }
            None => std::future::pending().await,
        }
    }

    /// The active segment completed; move on to the next one.
    pub fn complete(&mut self, turn: &TurnState) -> Progress {
        let Some(active) = self.active.take() else {
            return Progress::default();
        };
        info!(speaker = %active.item.speaker_id, "Segment finished");
        drop(active);
        self.advance(turn, true)
    }

    /// Stop the active segment and discard everything queued. Returns the
    /// number of segments dropped, the active one included.
    pub fn abandon(&mut self, turn: &TurnState) -> usize {
        let mut dropped = self.queue.len();
        self.queue.clear();
        if let Some(mut active) = self.active.take() {
            active.playing.stop();
            dropped += 1;
        }
        if turn.current() == ConversationTurn::AgentSpeaking {
            turn.end_speaking().ok();
        }
        if dropped > 0 {
            warn!(dropped, "Playback abandoned");
        }
        dropped
    }

    fn advance(&mut self, turn: &TurnState, mut handled: bool) -> Progress {
        let mut progress = Progress::default();

        // Never take the floor from a recording user.
        if turn.current() == ConversationTurn::UserRecording {
            return progress;
        }

        while let Some(item) = self.queue.pop_front() {
            match self.output.play(&item.audio) {
                Ok(playing) => {
                    if turn.current() == ConversationTurn::Idle {
                        turn.begin_speaking().ok();
                    }
                    info!(
                        speaker = %item.speaker_id,
                        bytes = item.audio.len(),
                        queued = self.queue.len(),
                        "Segment playing"
                    );
                    progress.started = Some(item.speaker_id.clone());
                    self.active = Some(Active { item, playing });
                    return progress;
                }
                Err(err) => {
                    warn!(speaker = %item.speaker_id, error = %err, "Skipping unplayable segment");
                    progress.skipped.push((item.speaker_id, err));
                    handled = true;
                }
            }
        }

        if turn.current() == ConversationTurn::AgentSpeaking {
            turn.end_speaking().ok();
        }
        progress.drained = handled;
        progress
    }
}
