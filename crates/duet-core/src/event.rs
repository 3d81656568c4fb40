//! Events emitted to whatever front-end is rendering the conversation.
//!
//! None of these carry state the core depends on; a front-end is free to
//! drop them.

use std::fmt;

use crate::ConversationTurn;

/// Events emitted by the conversation for the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// The turn has changed
    TurnChanged(ConversationTurn),
    /// A line to append to the transcript
    Message(ChatMessage),
    /// Something the user should be told about
    Notice(Notice),
}

/// Author of a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
    System,
}

/// One line of the in-memory transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    /// Persona name for agent lines that came with a speaker id
    pub speaker: Option<String>,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            speaker: None,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            speaker: None,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            speaker: None,
            content: content.into(),
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.role, &self.speaker) {
            (_, Some(speaker)) => write!(f, "{}: {}", speaker, self.content),
            (Role::User, None) => write!(f, "You: {}", self.content),
            (Role::Agent, None) => write!(f, "Agent: {}", self.content),
            (Role::System, None) => write!(f, "System: {}", self.content),
        }
    }
}

/// Category of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Microphone access was denied
    Permission,
    /// The microphone failed for another reason
    Capture,
    /// The voice channel failed to open, errored or closed
    Channel,
    /// A text or file submission failed
    Request,
    /// A synthesized segment could not be played
    Playback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
