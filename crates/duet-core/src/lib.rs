//! Core types, turn state and configuration for duet.
//!
//! This crate provides the platform-agnostic pieces shared by every other
//! duet crate: the conversation turn state machine, UI-facing events and the
//! configuration file.

mod config;
mod event;
mod turn;

pub use config::{Config, ConfigManager, DetectorConfig};
pub use event::{ChatMessage, Notice, NoticeKind, Role, UiEvent};
pub use turn::{ConversationTurn, TurnError, TurnState, TurnWatch};

/// Application name
pub const APP_NAME: &str = "duet";

/// Pretty application name for display
pub const APP_NAME_PRETTY: &str = "Duet";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";
