// Re-export from sub-crates
pub use duet_audio::{
    AudioInput, AudioOutput, CaptureError, CpalInput, PlaybackError, RodioOutput, StopReason,
};
pub use duet_channel::{Backend, ChannelSession, HttpBackend, Loopback, RequestError};
pub use duet_core::{
    APP_NAME, APP_NAME_PRETTY, ChatMessage, Config, ConfigManager, ConversationTurn,
    DEFAULT_LOG_LEVEL, Notice, NoticeKind, Role, UiEvent,
};

// App-specific modules
pub mod conversation;
pub mod notify;

pub use conversation::{Command, Conversation, ConversationHandle};

// Version from this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
