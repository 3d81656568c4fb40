//! The persistent voice-turn channel.
//!
//! Socket I/O runs on two spawned tasks, one per direction. Frames reach the
//! session in arrival order and are decoded by [`ChannelSession::next_event`]
//! on the caller's task, so no two inbound messages are ever handled at the
//! same time.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{
    AudioSegment, InboundMessage, MalformedMessage, OutboundMessage, decode_inbound,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    #[error("timed out connecting to {url} after {}s", .after.as_secs())]
    Timeout { url: String, after: Duration },
    #[error("voice channel is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Something the dispatcher has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A synthesized segment arrived
    Segment(AudioSegment),
    /// The server closed the connection, with its reason if it gave one
    Closed(Option<String>),
    /// The connection broke
    Failed(String),
}

#[derive(Debug)]
enum Incoming {
    Text(String),
    Binary(usize),
    Closed(Option<String>),
    Failed(String),
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// One open voice-turn connection. Once it reports `Closed` or `Failed` it
/// stays closed; reconnecting means creating a new session.
#[derive(Debug)]
pub struct ChannelSession {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    open: bool,
}

impl ChannelSession {
    /// Open a WebSocket connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        info!(url, "Connecting voice channel");
        let (ws, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| ChannelError::Connect {
                    url: url.to_string(),
                    source: Box::new(e),
                })?;
        info!(url, "Voice channel established");

        let (ws_sender, ws_receiver) = ws.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(outbound_loop(outgoing_rx, ws_sender, incoming_tx.clone()));
        tokio::spawn(inbound_loop(ws_receiver, incoming_tx));

        Ok(Self {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            open: true,
        })
    }

    /// Like [`ChannelSession::connect`], but gives up once `limit` has passed
    /// without a completed handshake.
    pub async fn connect_timeout(url: &str, limit: Duration) -> Result<Self, ChannelError> {
        tokio::time::timeout(limit, Self::connect(url))
            .await
            .map_err(|_| {
                warn!(url, ?limit, "Voice channel handshake timed out");
                ChannelError::Timeout {
                    url: url.to_string(),
                    after: limit,
                }
            })?
    }

    /// A session wired to an in-memory peer instead of a socket.
    pub fn loopback() -> (Self, Loopback) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let session = Self {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            open: true,
        };
        let peer = Loopback {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
        };
        (session, peer)
    }

    pub fn is_open(&self) -> bool {
        self.open && !self.outgoing.is_closed()
    }

    pub fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let text = serde_json::to_string(message)?;
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a finished recording.
    pub fn submit_audio(
        &self,
        wav: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), ChannelError> {
        debug!(bytes = wav.len(), sample_rate, channels, "Submitting recording");
        self.send(&OutboundMessage::AudioSubmission {
            blob: wav,
            sample_rate,
            channels,
        })
    }

    /// Tell the server the last segment has been played.
    pub fn turn_done(&self) -> Result<(), ChannelError> {
        self.send(&OutboundMessage::TurnDone)
    }

    /// Next event in arrival order. Malformed frames are logged and skipped.
    /// Pending forever once the session has closed.
    pub async fn next_event(&mut self) -> ChannelEvent {
        if !self.open {
            return std::future::pending().await;
        }

        loop {
            let event = match self.incoming.recv().await {
                Some(Incoming::Text(text)) => match decode_inbound(&text) {
                    Ok(InboundMessage::AudioSegment(segment)) => ChannelEvent::Segment(segment),
                    Err(err) => {
                        warn!(error = %err, "Dropping malformed channel message");
                        continue;
                    }
                },
                Some(Incoming::Binary(len)) => {
                    warn!(error = %MalformedMessage::Binary(len), "Dropping malformed channel message");
                    continue;
                }
                Some(Incoming::Closed(reason)) => ChannelEvent::Closed(reason),
                Some(Incoming::Failed(error)) => ChannelEvent::Failed(error),
                None => ChannelEvent::Closed(None),
            };

            if !matches!(event, ChannelEvent::Segment(_)) {
                self.open = false;
            }
            return event;
        }
    }

    /// Close the connection from our side.
    pub fn close(&mut self) {
        if self.open {
            self.outgoing.send(Outgoing::Close).ok();
            self.open = false;
            info!("Voice channel closed");
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// The server end of a [`ChannelSession::loopback`] session.
#[derive(Debug)]
pub struct Loopback {
    incoming: mpsc::UnboundedSender<Incoming>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
}

impl Loopback {
    pub fn send_segment(&self, segment: AudioSegment) -> bool {
        match serde_json::to_string(&InboundMessage::AudioSegment(segment)) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Send a raw text frame, well formed or not.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.incoming.send(Incoming::Text(text.into())).is_ok()
    }

    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.incoming.send(Incoming::Binary(data.len())).is_ok()
    }

    pub fn close(&self, reason: Option<&str>) {
        self.incoming
            .send(Incoming::Closed(reason.map(str::to_string)))
            .ok();
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.incoming.send(Incoming::Failed(error.into())).ok();
    }

    /// Next message from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        match self.outgoing.recv().await? {
            Outgoing::Text(text) => serde_json::from_str(&text).ok(),
            Outgoing::Close => None,
        }
    }

    /// Like [`Loopback::recv`] but without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        match self.outgoing.try_recv().ok()? {
            Outgoing::Text(text) => serde_json::from_str(&text).ok(),
            Outgoing::Close => None,
        }
    }
}

async fn outbound_loop(
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut ws_sender: SplitSink<WsStream, Message>,
    incoming: mpsc::UnboundedSender<Incoming>,
) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Text(text) => {
                if let Err(e) = ws_sender.send(Message::text(text)).await {
                    warn!(error = %e, "Failed to send on voice channel");
                    incoming.send(Incoming::Failed(e.to_string())).ok();
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    ws_sender.close().await.ok();
    debug!("Voice channel outbound loop ended");
}

async fn inbound_loop(
    mut ws_receiver: SplitStream<WsStream>,
    incoming: mpsc::UnboundedSender<Incoming>,
) {
    while let Some(frame) = ws_receiver.next().await {
        let forwarded = match frame {
            Ok(Message::Text(text)) => Incoming::Text(text.to_string()),
            Ok(Message::Binary(data)) => Incoming::Binary(data.len()),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                incoming.send(Incoming::Closed(reason)).ok();
                return;
            }
            // Ping/pong are answered by tungstenite.
            Ok(_) => continue,
            Err(e) => {
                incoming.send(Incoming::Failed(e.to_string())).ok();
                return;
            }
        };
        if incoming.send(forwarded).is_err() {
            return;
        }
    }
    incoming.send(Incoming::Closed(None)).ok();
}
