//! The conversation loop.
//!
//! [`Conversation`] owns every stateful piece of a session: the turn state,
//! the active recording, the playback queue, the voice channel and the
//! backend client. Everything that can happen (user commands, captured audio,
//! silence, finished playback, inbound segments, finished requests) arrives
//! as a future polled by one `select!` loop, so handlers never run
//! concurrently with each other.

use std::sync::Arc;
use std::time::Duration;

use duet_audio::{
    AudioInput, AudioOutput, CaptureError, CaptureEvent, CaptureSession, PlaybackController,
    PlaybackItem, Progress, SilenceWatch, StopReason,
};
use duet_channel::{Backend, ChannelError, ChannelEvent, ChannelSession, RequestError};
use duet_core::{
    ChatMessage, Config, ConversationTurn, DetectorConfig, Notice, NoticeKind, TurnState,
    TurnWatch, UiEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Shown when a request fails without a server explanation.
pub const REQUEST_FAILED_MESSAGE: &str =
    "Sorry, I encountered an error processing your request. Please try again.";

/// Something the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the voice channel unless it is already open
    Connect,
    StartRecording,
    StopRecording,
    SubmitText(String),
    SubmitFile { name: String, contents: Vec<u8> },
    Shutdown,
}

/// Cloneable front-end handle to a running [`Conversation`].
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    commands: mpsc::UnboundedSender<Command>,
    turn: TurnWatch,
}

impl ConversationHandle {
    /// Ask for a new recording. Returns false without sending anything when
    /// the turn does not allow recording right now.
    pub fn start_recording(&self) -> bool {
        if !self.turn.can_record() {
            debug!(turn = ?self.turn.current(), "Recording blocked");
            return false;
        }
        self.send(Command::StartRecording)
    }

    pub fn stop_recording(&self) -> bool {
        self.send(Command::StopRecording)
    }

    pub fn connect(&self) -> bool {
        self.send(Command::Connect)
    }

    pub fn submit_text(&self, text: impl Into<String>) -> bool {
        self.send(Command::SubmitText(text.into()))
    }

    pub fn submit_file(&self, name: impl Into<String>, contents: Vec<u8>) -> bool {
        self.send(Command::SubmitFile {
            name: name.into(),
            contents,
        })
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    /// Current turn as seen from outside the loop.
    pub fn turn(&self) -> ConversationTurn {
        self.turn.current()
    }

    pub fn watch(&self) -> TurnWatch {
        self.turn.clone()
    }

    /// Returns false once the conversation has ended.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// A live recording and the timers that may end it.
struct Recording {
    session: CaptureSession,
    watch: SilenceWatch,
}

enum RecordingEvent {
    Capture(CaptureEvent),
    Stop(StopReason),
}

impl Recording {
    async fn next(&mut self) -> RecordingEvent {
        tokio::select! {
            event = self.session.next_event() => RecordingEvent::Capture(event),
            reason = self.watch.next_stop() => RecordingEvent::Stop(reason),
        }
    }
}

async fn next_recording_event(recording: &mut Option<Recording>) -> RecordingEvent {
    match recording {
        Some(recording) => recording.next().await,
        None => std::future::pending().await,
    }
}

async fn next_channel_event(channel: &mut Option<ChannelSession>) -> ChannelEvent {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

type RequestResult = Result<String, RequestError>;
type ConnectResult = Result<ChannelSession, ChannelError>;

pub struct Conversation {
    turn: TurnState,
    published: ConversationTurn,
    input: Box<dyn AudioInput>,
    detector: DetectorConfig,
    recording: Option<Recording>,
    playback: PlaybackController,
    channel: Option<ChannelSession>,
    channel_url: String,
    connect_timeout: Duration,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    connecting: bool,
    backend: Arc<dyn Backend>,
    request_tx: mpsc::UnboundedSender<RequestResult>,
    request_rx: mpsc::UnboundedReceiver<RequestResult>,
    busy: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<UiEvent>,
    welcome: String,
}

impl Conversation {
    /// Build a conversation along with its command handle and the stream of
    /// events for the front-end.
    pub fn new(
        config: &Config,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
        backend: Arc<dyn Backend>,
    ) -> (Self, ConversationHandle, mpsc::UnboundedReceiver<UiEvent>) {
        let turn = TurnState::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let handle = ConversationHandle {
            commands: command_tx,
            turn: turn.watch(),
        };

        let conversation = Self {
            published: turn.current(),
            turn,
            input,
            detector: config.detector,
            recording: None,
            playback: PlaybackController::new(output),
            channel: None,
            channel_url: config.channel_url.clone(),
            connect_timeout: config.connect_timeout(),
            connect_tx,
            connect_rx,
            connecting: false,
            backend,
            request_tx,
            request_rx,
            busy: false,
            commands: command_rx,
            events: event_tx,
            welcome: config.welcome_message().to_string(),
        };

        (conversation, handle, event_rx)
    }

    /// Use an already open channel instead of connecting on demand.
    pub fn with_channel(mut self, channel: ChannelSession) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Run until [`Command::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        info!(backend = self.backend.name(), "Conversation started");
        let welcome = ChatMessage::agent(self.welcome.clone());
        self.emit(UiEvent::Message(welcome));

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = next_recording_event(&mut self.recording) => match event {
                    RecordingEvent::Capture(CaptureEvent::Chunk(bytes)) => {
                        trace!(bytes, "Audio chunk captured");
                    }
                    RecordingEvent::Capture(CaptureEvent::Failed(reason)) => {
                        self.notice(NoticeKind::Capture, format!("Microphone error: {}", reason));
                        self.finish_recording(StopReason::InputFailed);
                    }
                    RecordingEvent::Capture(CaptureEvent::InputClosed) => {
                        self.notice(NoticeKind::Capture, "Microphone stopped unexpectedly");
                        self.finish_recording(StopReason::InputFailed);
                    }
                    RecordingEvent::Stop(reason) => self.finish_recording(reason),
                },
                _ = self.playback.finished() => {
                    let progress = self.playback.complete(&self.turn);
                    self.handle_progress(progress);
                }
                event = next_channel_event(&mut self.channel) => self.handle_channel(event),
                Some(result) = self.request_rx.recv() => self.handle_request_result(result),
                Some(result) = self.connect_rx.recv() => self.handle_connected(result),
            }
        }

        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::StartRecording => self.start_recording(),
            Command::StopRecording => self.finish_recording(StopReason::Manual),
            Command::SubmitText(text) => self.submit_text(text),
            Command::SubmitFile { name, contents } => self.submit_file(name, contents),
            Command::Shutdown => {}
        }
    }

    /// The handshake runs on its own task and reports back through
    /// `connect_rx`, so recording and playback keep running meanwhile.
    fn connect(&mut self) {
        if self.channel.as_ref().is_some_and(ChannelSession::is_open) {
            info!("Voice channel already connected");
            return;
        }
        if self.connecting {
            info!("Voice channel connection already in progress");
            return;
        }

        self.connecting = true;
        let url = self.channel_url.clone();
        let limit = self.connect_timeout;
        let tx = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = ChannelSession::connect_timeout(&url, limit).await;
            // The conversation may have shut down in the meantime.
            tx.send(result).ok();
        });
    }

    fn handle_connected(&mut self, result: ConnectResult) {
        self.connecting = false;
        match result {
            Ok(session) => self.channel = Some(session),
            Err(e) => {
                self.channel = None;
                self.notice(NoticeKind::Channel, format!("Could not connect: {}", e));
            }
        }
    }

    fn start_recording(&mut self) {
        if self.recording.is_some() || !self.turn.watch().can_record() {
            info!(turn = ?self.turn.current(), "Ignoring recording request");
            return;
        }

        let mut session = CaptureSession::new();
        match session.start(self.input.as_ref()) {
            Ok(()) => {}
            Err(CaptureError::PermissionDenied(reason)) => {
                self.notice(
                    NoticeKind::Permission,
                    format!("Microphone access was denied: {}", reason),
                );
                return;
            }
            Err(e) => {
                self.notice(NoticeKind::Capture, format!("Could not start recording: {}", e));
                return;
            }
        }

        if let Err(e) = self.turn.begin_recording() {
            warn!(error = %e, "Turn changed before recording started");
            session.stop().ok();
            return;
        }

        let watch = SilenceWatch::start(&self.detector, session.level());
        self.recording = Some(Recording { session, watch });
        self.publish_turn();
    }

    /// End the active recording. The microphone is released first, then the
    /// turn goes back to idle, then the audio is submitted.
    fn finish_recording(&mut self, reason: StopReason) {
        let Some(mut recording) = self.recording.take() else {
            debug!(?reason, "No recording to stop");
            return;
        };
        let blob = recording.session.stop();
        drop(recording);

        info!(?reason, "Recording stopped");
        self.turn.end_recording().ok();
        self.publish_turn();

        match blob {
            Ok(blob) if matches!(reason, StopReason::InputFailed | StopReason::Aborted) => {
                info!(bytes = blob.len(), "Discarding recording");
            }
            Ok(blob) if blob.is_empty() => info!("Recording is empty, nothing to send"),
            Ok(blob) => {
                let seconds = blob.duration().as_secs_f64();
                match self.channel.as_ref().filter(|channel| channel.is_open()) {
                    Some(channel) => {
                        let format = blob.format();
                        let sent = blob.to_wav().map_err(|e| e.to_string()).and_then(|wav| {
                            channel
                                .submit_audio(wav, format.sample_rate, format.channels)
                                .map_err(|e| e.to_string())
                        });
                        match sent {
                            Ok(()) => self.emit(UiEvent::Message(ChatMessage::user(format!(
                                "(voice message, {:.1}s)",
                                seconds
                            )))),
                            Err(e) => self.notice(
                                NoticeKind::Channel,
                                format!("Could not send recording: {}", e),
                            ),
                        }
                    }
                    None => self.notice(
                        NoticeKind::Channel,
                        "Not connected to the voice channel, recording was not sent",
                    ),
                }
            }
            Err(e) => self.notice(NoticeKind::Capture, format!("Recording failed: {}", e)),
        }

        let progress = self.playback.resume(&self.turn);
        self.handle_progress(progress);
    }

    fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Segment(segment) => {
                if let Some(text) = &segment.text {
                    let message = ChatMessage::agent(text.clone()).with_speaker(&segment.speaker_id);
                    self.emit(UiEvent::Message(message));
                }
                let item = PlaybackItem {
                    speaker_id: segment.speaker_id,
                    audio: segment.payload,
                    text: segment.text,
                };
                let progress = self.playback.enqueue(item, &self.turn);
                self.handle_progress(progress);
            }
            ChannelEvent::Closed(reason) => {
                let message = match reason {
                    Some(reason) => format!("Voice channel closed: {}", reason),
                    None => "Voice channel closed".to_string(),
                };
                self.channel_lost(message);
            }
            ChannelEvent::Failed(error) => {
                self.channel_lost(format!("Voice channel failed: {}", error));
            }
        }
    }

    /// Everything tied to the voice exchange ends with the channel.
    fn channel_lost(&mut self, message: String) {
        self.notice(NoticeKind::Channel, message);

        if let Some(mut recording) = self.recording.take() {
            recording.session.stop().ok();
            info!("Recording discarded");
        }
        self.playback.abandon(&self.turn);
        let previous = self.turn.force_idle();
        debug!(?previous, "Turn reset after channel loss");
        self.channel = None;
        self.publish_turn();
    }

    /// `turnDone` goes out once the queue has drained, not once per segment.
    fn handle_progress(&mut self, progress: Progress) {
        for (speaker, error) in progress.skipped {
            self.notice(
                NoticeKind::Playback,
                format!("Could not play segment from {}: {}", speaker, error),
            );
        }
        self.publish_turn();

        if progress.drained {
            if let Some(channel) = self.channel.as_ref() {
                if let Err(e) = channel.turn_done() {
                    warn!(error = %e, "Failed to send turn completion");
                }
            }
        }
    }

    fn submit_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if !self.begin_request() {
            return;
        }
        self.emit(UiEvent::Message(ChatMessage::user(text.clone())));

        let backend = Arc::clone(&self.backend);
        let tx = self.request_tx.clone();
        tokio::spawn(async move {
            tx.send(backend.process_text(&text).await).ok();
        });
    }

    fn submit_file(&mut self, name: String, contents: Vec<u8>) {
        if !self.begin_request() {
            return;
        }
        self.emit(UiEvent::Message(ChatMessage::user(format!("Uploaded {}", name))));

        let backend = Arc::clone(&self.backend);
        let tx = self.request_tx.clone();
        tokio::spawn(async move {
            tx.send(backend.process_file(&name, contents).await).ok();
        });
    }

    fn begin_request(&mut self) -> bool {
        if self.busy {
            self.notice(NoticeKind::Request, "Still working on the previous request");
            return false;
        }
        self.busy = true;
        true
    }

    fn handle_request_result(&mut self, result: RequestResult) {
        self.busy = false;
        let reply = match result {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "Request failed");
                e.detail()
                    .map(str::to_string)
                    .unwrap_or_else(|| REQUEST_FAILED_MESSAGE.to_string())
            }
        };
        self.emit(UiEvent::Message(ChatMessage::agent(reply)));
    }

    fn teardown(&mut self) {
        if let Some(mut recording) = self.recording.take() {
            recording.session.stop().ok();
        }
        self.playback.abandon(&self.turn);
        self.turn.force_idle();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.publish_turn();
        info!("Conversation ended");
    }

    fn publish_turn(&mut self) {
        let current = self.turn.current();
        if current != self.published {
            self.published = current;
            debug!(turn = ?current, "Turn changed");
            self.emit(UiEvent::TurnChanged(current));
        }
    }

    fn notice(&self, kind: NoticeKind, message: impl Into<String>) {
        let notice = Notice::new(kind, message);
        warn!(notice = ?notice.kind, "{}", notice.message);
        self.emit(UiEvent::Notice(notice));
    }

    fn emit(&self, event: UiEvent) {
        self.events.send(event).ok();
    }
}
