//! Voice session lifecycle, turn coordination, and latency accounting.

pub mod events;
pub mod latency;
pub mod manager;
pub mod turn;
pub mod types;

pub use events::{SessionEvent, SessionSnapshot};
pub use latency::{LatencyAverages, LatencyEntry, LatencyTracker, Stage};
pub use manager::{SessionManagerConfig, VoiceSessionManager};
pub use turn::{BotState, TurnInputs, derive_bot_state};
pub use types::{
    CaptureHandle, ChannelId, EndReason, GuildId, Session, SessionError, SessionMode, UserId,
};
