//! Conversation turn state.
//!
//! [`TurnState`] is the only place the current turn can change. Everything
//! else observes it through a [`TurnWatch`].

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Who currently holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationTurn {
    /// Nobody; the user may start recording
    #[default]
    Idle,
    /// The user's speech is being captured
    UserRecording,
    /// Synthesized agent audio is playing
    AgentSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("illegal turn transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: ConversationTurn,
        to: ConversationTurn,
    },
}

/// Owner of the conversation turn. Transitions outside of
/// `Idle <-> UserRecording` and `Idle <-> AgentSpeaking` are refused.
#[derive(Debug)]
pub struct TurnState {
    tx: watch::Sender<ConversationTurn>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConversationTurn::Idle);
        Self { tx }
    }

    pub fn current(&self) -> ConversationTurn {
        *self.tx.borrow()
    }

    /// A read-only view that follows every transition.
    pub fn watch(&self) -> TurnWatch {
        TurnWatch {
            rx: self.tx.subscribe(),
        }
    }

    /// `Idle -> UserRecording`
    pub fn begin_recording(&self) -> Result<(), TurnError> {
        self.transition(ConversationTurn::Idle, ConversationTurn::UserRecording)
    }

    /// `UserRecording -> Idle`
    pub fn end_recording(&self) -> Result<(), TurnError> {
        self.transition(ConversationTurn::UserRecording, ConversationTurn::Idle)
    }

    /// `Idle -> AgentSpeaking`
    pub fn begin_speaking(&self) -> Result<(), TurnError> {
        self.transition(ConversationTurn::Idle, ConversationTurn::AgentSpeaking)
    }

    /// `AgentSpeaking -> Idle`
    pub fn end_speaking(&self) -> Result<(), TurnError> {
        self.transition(ConversationTurn::AgentSpeaking, ConversationTurn::Idle)
    }

    /// Return to `Idle` from wherever the turn is. Used on error paths only;
    /// the caller is responsible for having released whatever resource the
    /// previous turn held.
    pub fn force_idle(&self) -> ConversationTurn {
        let previous = self.tx.send_replace(ConversationTurn::Idle);
        if previous != ConversationTurn::Idle {
            debug!(from = ?previous, "Turn forced to idle");
        }
        previous
    }

    fn transition(&self, from: ConversationTurn, to: ConversationTurn) -> Result<(), TurnError> {
        let current = self.current();
        if current != from {
            return Err(TurnError::IllegalTransition { from: current, to });
        }
        self.tx.send_replace(to);
        debug!(from = ?from, to = ?to, "Turn changed");
        Ok(())
    }
}

/// Observer side of [`TurnState`].
#[derive(Debug, Clone)]
pub struct TurnWatch {
    rx: watch::Receiver<ConversationTurn>,
}

impl TurnWatch {
    pub fn current(&self) -> ConversationTurn {
        *self.rx.borrow()
    }

    /// Whether a new recording would be accepted right now.
    pub fn can_record(&self) -> bool {
        self.current() == ConversationTurn::Idle
    }

    /// Wait for the next transition. Returns `None` once the owning
    /// [`TurnState`] is gone.
    pub async fn changed(&mut self) -> Option<ConversationTurn> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
