//! End-to-end turn-taking scenarios with fake devices and an in-memory
//! voice channel.

use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet::conversation::{Command, Conversation, ConversationHandle, REQUEST_FAILED_MESSAGE};
use duet_audio::{
    AudioFormat, AudioInput, AudioOutput, CaptureError, CaptureSink, MicrophoneGuard,
    PlaybackError, Playing,
};
use duet_channel::{AudioSegment, Backend, ChannelSession, Loopback, OutboundMessage, RequestError};
use duet_core::{ChatMessage, Config, ConversationTurn, Notice, NoticeKind, Role, UiEvent};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

const FORMAT: AudioFormat = AudioFormat {
    sample_rate: 16_000,
    channels: 1,
};

/// Microphone that hands its sink to the test and counts releases.
#[derive(Clone, Default)]
struct FakeMic {
    sink: Rc<RefCell<Option<CaptureSink>>>,
    releases: Rc<Cell<usize>>,
    deny: bool,
}

impl AudioInput for FakeMic {
    fn acquire(&self, sink: CaptureSink) -> Result<MicrophoneGuard, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied("blocked by user".into()));
        }
        self.sink.replace(Some(sink));
        let releases = self.releases.clone();
        Ok(MicrophoneGuard::new(FORMAT, move || {
            releases.set(releases.get() + 1)
        }))
    }
}

impl FakeMic {
    fn push(&self, samples: &[f32]) {
        let sink = self.sink.borrow();
        assert!(sink.as_ref().expect("microphone not acquired").push(samples));
    }

    fn acquired(&self) -> bool {
        self.sink.borrow().is_some()
    }
}

type Play = (Vec<u8>, oneshot::Sender<()>);

/// Output that reports every started segment; the test decides when each
/// one finishes.
struct FakeSpeaker {
    plays: mpsc::UnboundedSender<Play>,
    stops: Rc<Cell<usize>>,
}

impl AudioOutput for FakeSpeaker {
    fn play(&mut self, audio: &[u8]) -> Result<Playing, PlaybackError> {
        if audio == b"broken" {
            return Err(PlaybackError::Decode("unrecognized format".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.plays.send((audio.to_vec(), tx)).ok();
        let stops = self.stops.clone();
        Ok(Playing::new(rx, move || stops.set(stops.get() + 1)))
    }
}

#[derive(Default)]
struct FakeBackend {
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn process_text(&self, text: &str) -> Result<String, RequestError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match text {
            "reject me" => Err(RequestError::Rejected {
                status: 400,
                detail: "Text is empty".to_string(),
            }),
            "offline" => Err(RequestError::Status(503)),
            _ => Ok(format!("Summary of: {}", text)),
        }
    }

    async fn process_file(&self, name: &str, contents: Vec<u8>) -> Result<String, RequestError> {
        Ok(format!("{} ({} bytes)", name, contents.len()))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct Harness {
    handle: ConversationHandle,
    events: mpsc::UnboundedReceiver<UiEvent>,
    mic: FakeMic,
    plays: mpsc::UnboundedReceiver<Play>,
    stops: Rc<Cell<usize>>,
}

impl Harness {
    async fn next_event(&mut self) -> UiEvent {
        self.events.recv().await.expect("conversation ended")
    }

    async fn wait_turn(&mut self, want: ConversationTurn) {
        loop {
            if let UiEvent::TurnChanged(turn) = self.next_event().await {
                if turn == want {
                    return;
                }
            }
        }
    }

    async fn wait_notice(&mut self) -> Notice {
        loop {
            if let UiEvent::Notice(notice) = self.next_event().await {
                return notice;
            }
        }
    }

    async fn wait_message(&mut self, role: Role) -> ChatMessage {
        loop {
            if let UiEvent::Message(message) = self.next_event().await {
                if message.role == role && message.content != Config::default().welcome_message() {
                    return message;
                }
            }
        }
    }

    async fn next_play(&mut self) -> Play {
        self.plays.recv().await.expect("output dropped")
    }
}

fn build(config: &Config, mic: FakeMic, backend: FakeBackend) -> (Conversation, Harness) {
    let (plays_tx, plays) = mpsc::unbounded_channel();
    let stops = Rc::new(Cell::new(0));
    let speaker = FakeSpeaker {
        plays: plays_tx,
        stops: stops.clone(),
    };
    let (conversation, handle, events) = Conversation::new(
        config,
        Box::new(mic.clone()),
        Box::new(speaker),
        Arc::new(backend),
    );
    let harness = Harness {
        handle,
        events,
        mic,
        plays,
        stops,
    };
    (conversation, harness)
}

fn connected() -> (Conversation, Harness, Loopback) {
    let (conversation, harness) = build(&Config::default(), FakeMic::default(), FakeBackend::default());
    let (session, peer) = ChannelSession::loopback();
    (conversation.with_channel(session), harness, peer)
}

fn segment(speaker: &str, payload: &[u8], text: Option<&str>) -> AudioSegment {
    AudioSegment {
        payload: payload.to_vec(),
        speaker_id: speaker.to_string(),
        text: text.map(str::to_string),
        stage: None,
    }
}

fn wav_samples(blob: &[u8]) -> Vec<i16> {
    let reader = hound::WavReader::new(Cursor::new(blob)).unwrap();
    assert_eq!(reader.spec().sample_rate, FORMAT.sample_rate);
    assert_eq!(reader.spec().channels, FORMAT.channels);
    reader.into_samples::<i16>().map(Result::unwrap).collect()
}

#[tokio::test]
async fn test_welcome_message_comes_first() {
    let (conversation, mut h) = build(&Config::default(), FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        let UiEvent::Message(message) = h.next_event().await else {
            panic!("expected the welcome message");
        };
        assert_eq!(message.role, Role::Agent);
        assert_eq!(message.content, Config::default().welcome_message());
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_recording_blocked_while_agent_speaks() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        peer.send_segment(segment("Alex", b"one", None));
        h.wait_turn(ConversationTurn::AgentSpeaking).await;

        assert!(!h.handle.start_recording());
        // Even a raw command is refused by the loop itself.
        h.handle.send(Command::StartRecording);
        h.handle.submit_text("sync");
        h.wait_message(Role::User).await;
        assert!(!h.mic.acquired());
        assert_eq!(h.handle.turn(), ConversationTurn::AgentSpeaking);

        let (audio, done) = h.next_play().await;
        assert_eq!(audio, b"one");
        done.send(()).unwrap();
        h.wait_turn(ConversationTurn::Idle).await;
        assert_eq!(peer.recv().await, Some(OutboundMessage::TurnDone));

        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        assert!(h.mic.acquired());
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_submitted_blob_matches_captured_chunks() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;

        h.mic.push(&[0.5; 160]);
        h.mic.push(&[-0.5; 80]);
        h.mic.push(&[0.25; 40]);
        h.handle.stop_recording();
        h.wait_turn(ConversationTurn::Idle).await;
        assert_eq!(h.mic.releases.get(), 1);

        let Some(OutboundMessage::AudioSubmission {
            blob,
            sample_rate,
            channels,
        }) = peer.recv().await
        else {
            panic!("expected an audio submission");
        };
        assert_eq!(sample_rate, FORMAT.sample_rate);
        assert_eq!(channels, FORMAT.channels);

        let samples = wav_samples(&blob);
        // 320 + 160 + 80 bytes of PCM16
        assert_eq!(samples.len() * 2, 560);
        assert_eq!(samples[0], (0.5 * i16::MAX as f32) as i16);
        assert_eq!(samples[279], (0.25 * i16::MAX as f32) as i16);
        h.handle.shutdown();
    });
}

#[tokio::test(start_paused = true)]
async fn test_silence_ends_recording() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        let start = Instant::now();
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        h.mic.push(&[0.0; 160]);

        h.wait_turn(ConversationTurn::Idle).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(5500), "{:?}", elapsed);
        assert_eq!(h.mic.releases.get(), 1);

        let Some(OutboundMessage::AudioSubmission { blob, .. }) = peer.recv().await else {
            panic!("expected an audio submission");
        };
        assert_eq!(wav_samples(&blob).len(), 160);

        // The stopped recording does not fire again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(peer.try_recv(), None);
        h.handle.shutdown();
    });
}

#[tokio::test(start_paused = true)]
async fn test_short_silence_keeps_recording() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        h.mic.push(&[0.0; 160]);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(h.handle.turn(), ConversationTurn::UserRecording);

        h.handle.stop_recording();
        h.wait_turn(ConversationTurn::Idle).await;
        assert!(matches!(
            peer.recv().await,
            Some(OutboundMessage::AudioSubmission { .. })
        ));
        h.handle.shutdown();
    });
}

#[tokio::test(start_paused = true)]
async fn test_safety_timer_ends_long_recording() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        let start = Instant::now();
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        // The level stays at this buffer, well above the threshold.
        h.mic.push(&[0.5; 160]);

        h.wait_turn(ConversationTurn::Idle).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(120_000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(120_500), "{:?}", elapsed);
        assert!(matches!(
            peer.recv().await,
            Some(OutboundMessage::AudioSubmission { .. })
        ));
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_segments_play_in_order_and_turn_done_after_drain() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        peer.send_segment(segment("Alex", b"one", Some("Welcome to the show")));
        peer.send_segment(segment("Emma", b"two", Some("Glad to be here")));

        let message = h.wait_message(Role::Agent).await;
        assert_eq!(message.to_string(), "Alex: Welcome to the show");
        h.wait_turn(ConversationTurn::AgentSpeaking).await;

        let (audio, done) = h.next_play().await;
        assert_eq!(audio, b"one");
        done.send(()).unwrap();

        let (audio, done) = h.next_play().await;
        assert_eq!(audio, b"two");
        // Nothing is acknowledged until the queue is empty.
        assert_eq!(peer.try_recv(), None);
        assert_eq!(h.handle.turn(), ConversationTurn::AgentSpeaking);

        done.send(()).unwrap();
        h.wait_turn(ConversationTurn::Idle).await;
        assert_eq!(peer.recv().await, Some(OutboundMessage::TurnDone));
        assert_eq!(peer.try_recv(), None);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_channel_close_during_playback() {
    let (conversation, mut h, peer) = connected();

    tokio::join!(conversation.run(), async move {
        peer.send_segment(segment("Alex", b"one", None));
        peer.send_segment(segment("Emma", b"two", None));
        h.wait_turn(ConversationTurn::AgentSpeaking).await;
        let (audio, _done) = h.next_play().await;
        assert_eq!(audio, b"one");

        peer.close(Some("server restarting"));
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Channel);
        assert!(notice.message.contains("server restarting"));
        h.wait_turn(ConversationTurn::Idle).await;

        // The active segment was stopped and the queued one dropped.
        assert_eq!(h.stops.get(), 1);
        assert!(h.plays.try_recv().is_err());
        assert!(h.handle.start_recording());
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_channel_failure_discards_recording() {
    let (conversation, mut h, peer) = connected();

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        h.mic.push(&[0.5; 160]);

        peer.fail("connection reset");
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Channel);
        h.wait_turn(ConversationTurn::Idle).await;
        assert_eq!(h.mic.releases.get(), 1);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_segment_waits_for_recording_to_finish() {
    let (conversation, mut h, peer) = connected();

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;

        peer.send_segment(segment("Alex", b"one", Some("Are you there?")));
        h.wait_message(Role::Agent).await;
        assert!(h.plays.try_recv().is_err());
        assert_eq!(h.handle.turn(), ConversationTurn::UserRecording);

        h.handle.stop_recording();
        h.wait_turn(ConversationTurn::Idle).await;
        h.wait_turn(ConversationTurn::AgentSpeaking).await;
        let (audio, _done) = h.next_play().await;
        assert_eq!(audio, b"one");
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_unplayable_segment_still_completes_turn() {
    let (conversation, mut h, mut peer) = connected();

    tokio::join!(conversation.run(), async move {
        peer.send_segment(segment("Alex", b"broken", None));
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Playback);
        assert_eq!(peer.recv().await, Some(OutboundMessage::TurnDone));
        assert_eq!(h.handle.turn(), ConversationTurn::Idle);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_malformed_message_keeps_channel_open() {
    let (conversation, mut h, peer) = connected();

    tokio::join!(conversation.run(), async move {
        peer.send_text(r#"{"speaker":"Alex","audio":"/static/a.mp3"}"#);
        peer.send_binary(&[0, 1, 2]);
        peer.send_segment(segment("Alex", b"one", None));
        h.wait_turn(ConversationTurn::AgentSpeaking).await;
        let (audio, _done) = h.next_play().await;
        assert_eq!(audio, b"one");
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_permission_denied_stays_idle() {
    let mic = FakeMic {
        deny: true,
        ..Default::default()
    };
    let (conversation, mut h) = build(&Config::default(), mic, FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Permission);
        assert_eq!(h.handle.turn(), ConversationTurn::Idle);
        assert_eq!(h.mic.releases.get(), 0);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_recording_without_channel_is_reported() {
    let (conversation, mut h) = build(&Config::default(), FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        h.mic.push(&[0.5; 160]);
        h.handle.stop_recording();

        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Channel);
        assert_eq!(h.handle.turn(), ConversationTurn::Idle);
        assert_eq!(h.mic.releases.get(), 1);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        channel_url: format!("ws://{}", addr),
        ..Config::default()
    };
    let (conversation, mut h) = build(&config, FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        h.handle.connect();
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Channel);
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_stalled_connect_does_not_block_recording() {
    // Never accepted, so the TCP connect succeeds but the upgrade never does.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        channel_url: format!("ws://{}", addr),
        ..Config::default()
    };
    let (conversation, mut h) = build(&config, FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        assert!(h.handle.start_recording());
        h.wait_turn(ConversationTurn::UserRecording).await;
        h.handle.connect();
        h.mic.push(&[0.5; 160]);
        h.handle.stop_recording();

        h.wait_turn(ConversationTurn::Idle).await;
        assert_eq!(h.mic.releases.get(), 1);
        // Still handshaking, so the recording had nowhere to go.
        assert_eq!(h.wait_notice().await.kind, NoticeKind::Channel);
        h.handle.shutdown();
    });
    drop(listener);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connect_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        channel_url: format!("ws://{}", addr),
        connect_timeout_secs: 3,
        ..Config::default()
    };
    let (conversation, mut h) = build(&config, FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        let start = Instant::now();
        h.handle.connect();
        // A second request while the first is pending is ignored.
        h.handle.connect();

        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Channel);
        assert!(notice.message.contains("timed out"), "{}", notice.message);
        assert!(start.elapsed() >= Duration::from_secs(3));

        // Once it has given up, connecting can be tried again.
        h.handle.connect();
        assert_eq!(h.wait_notice().await.kind, NoticeKind::Channel);
        h.handle.shutdown();
    });
    drop(listener);
}

#[tokio::test]
async fn test_connect_is_noop_when_open() {
    let (conversation, mut h, peer) = connected();

    tokio::join!(conversation.run(), async move {
        h.handle.connect();
        peer.send_segment(segment("Alex", b"one", None));
        h.wait_turn(ConversationTurn::AgentSpeaking).await;
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_text_requests() {
    let (conversation, mut h) = build(&Config::default(), FakeMic::default(), FakeBackend::default());

    tokio::join!(conversation.run(), async move {
        h.handle.submit_text("Plan an episode about rust");
        assert_eq!(
            h.wait_message(Role::User).await.content,
            "Plan an episode about rust"
        );
        assert_eq!(
            h.wait_message(Role::Agent).await.content,
            "Summary of: Plan an episode about rust"
        );

        h.handle.submit_text("reject me");
        assert_eq!(h.wait_message(Role::Agent).await.content, "Text is empty");

        h.handle.submit_text("offline");
        assert_eq!(
            h.wait_message(Role::Agent).await.content,
            REQUEST_FAILED_MESSAGE
        );

        h.handle.submit_file("notes.txt", b"hello".to_vec());
        assert_eq!(
            h.wait_message(Role::User).await.content,
            "Uploaded notes.txt"
        );
        assert_eq!(
            h.wait_message(Role::Agent).await.content,
            "notes.txt (5 bytes)"
        );
        h.handle.shutdown();
    });
}

#[tokio::test]
async fn test_one_request_at_a_time() {
    let gate = Arc::new(Notify::new());
    let backend = FakeBackend {
        gate: Some(gate.clone()),
    };
    let (conversation, mut h) = build(&Config::default(), FakeMic::default(), backend);

    tokio::join!(conversation.run(), async move {
        h.handle.submit_text("first");
        h.wait_message(Role::User).await;

        h.handle.submit_text("second");
        let notice = h.wait_notice().await;
        assert_eq!(notice.kind, NoticeKind::Request);

        gate.notify_one();
        assert_eq!(
            h.wait_message(Role::Agent).await.content,
            "Summary of: first"
        );

        h.handle.submit_text("third");
        assert_eq!(h.wait_message(Role::User).await.content, "third");
        gate.notify_one();
        assert_eq!(
            h.wait_message(Role::Agent).await.content,
            "Summary of: third"
        );
        h.handle.shutdown();
    });
}
