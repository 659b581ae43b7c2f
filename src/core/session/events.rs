//! Monitoring events broadcast by the session manager.
//!
//! Consumers subscribe through [`crate::core::session::VoiceSessionManager::subscribe`];
//! a slow subscriber lags and drops, it never blocks the session.

use serde::Serialize;

use super::latency::LatencyAverages;
use super::turn::BotState;
use super::types::{EndReason, SessionMode, TranscriptLine};

/// Point-in-time view of one session. Snowflake ids are serialized as
/// strings so JavaScript consumers don't lose precision.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub guild_id: String,
    pub voice_channel_id: String,
    pub text_channel_id: String,
    #[serde(flatten)]
    pub mode: SessionMode,
    pub bot_state: BotState,
    pub participant_count: usize,
    pub participants: Vec<String>,
    pub started_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub max_ends_at_ms: u64,
    pub inactivity_ends_at_ms: u64,
    pub bot_turn_open: bool,
    pub pending_transcription_turns: u32,
    pub pending_deferred_turns: u32,
    pub active_capture_count: usize,
    pub latency: LatencyAverages,
    pub transcript: Vec<TranscriptLine>,
}

/// Events published on the manager's broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        snapshot: SessionSnapshot,
    },
    SessionEnded {
        guild_id: String,
        session_id: String,
        reason: EndReason,
        /// Terminal snapshot, taken just before teardown
        snapshot: SessionSnapshot,
    },
    /// A user turn entered the session (capture committed or transcript
    /// received)
    TurnIn {
        guild_id: String,
        user_id: String,
        text: Option<String>,
    },
    /// The agent finished a reply turn
    TurnOut {
        guild_id: String,
        text: Option<String>,
    },
    /// A user barged in over agent speech
    Interruption {
        guild_id: String,
        superseded_response_id: Option<String>,
    },
    /// Periodic or on-change state publication
    Snapshot {
        snapshot: SessionSnapshot,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ended_serializes_tagged() {
        let ev = SessionEvent::TurnIn {
            guild_id: "123".to_string(),
            user_id: "456".to_string(),
            text: Some("hello".to_string()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "turn_in");
        assert_eq!(json["guild_id"], "123");
    }

    #[test]
    fn end_reason_is_snake_case() {
        let json = serde_json::to_value(EndReason::InactivityTimeout).unwrap();
        assert_eq!(json, "inactivity_timeout");
    }
}
