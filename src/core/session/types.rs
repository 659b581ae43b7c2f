//! Session data model.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::provider::ProviderKind;
use crate::utils::now_ms;

/// Chat-platform snowflake identifiers.
pub type GuildId = u64;
pub type ChannelId = u64;
pub type UserId = u64;

/// How a session produces speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionMode {
    /// One native realtime connection to the named provider
    NativeRealtime { provider: ProviderKind },
    /// Separate capture → transcribe → generate → speak stages; the
    /// session owns no provider connection
    SegmentedPipeline,
}

impl SessionMode {
    pub fn owns_connection(&self) -> bool {
        matches!(self, SessionMode::NativeRealtime { .. })
    }
}

/// Machine-readable reason a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MaxDuration,
    InactivityTimeout,
    ExplicitLeave,
    PresenceViolation,
    ProviderFatal,
}

/// One live input capture stream (a user the bot is listening to).
#[derive(Debug, Clone, Serialize)]
pub struct CaptureHandle {
    pub user_id: UserId,
    pub started_at_ms: u64,
    pub last_frame_at_ms: u64,
}

impl CaptureHandle {
    pub fn new(user_id: UserId) -> Self {
        let now = now_ms();
        Self {
            user_id,
            started_at_ms: now,
            last_frame_at_ms: now,
        }
    }
}

/// Mutable state of one per-guild session. Owned by the session manager;
/// mutated only under its lock.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub text_channel_id: ChannelId,
    pub mode: SessionMode,
    pub started_at_ms: u64,
    pub last_activity_at_ms: u64,
    /// Hard end deadline regardless of activity
    pub max_ends_at_ms: u64,
    /// Rolling deadline, pushed forward by activity
    pub inactivity_ends_at_ms: u64,
    pub participants: HashSet<UserId>,
    pub bot_turn_open: bool,
    pub pending_transcription_turns: u32,
    pub pending_deferred_turns: u32,
    pub active_captures: HashMap<UserId, CaptureHandle>,
    /// Conversation transcript; an agent correction replaces the last
    /// agent line instead of appending
    pub transcript: Vec<TranscriptLine>,
}

/// One transcript line, as published in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLine {
    pub role: TranscriptRole,
    pub text: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Agent,
}

impl Session {
    pub fn new(
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
        mode: SessionMode,
        max_duration_ms: u64,
        inactivity_timeout_ms: u64,
    ) -> Self {
        let now = now_ms();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            guild_id,
            voice_channel_id,
            text_channel_id,
            mode,
            started_at_ms: now,
            last_activity_at_ms: now,
            max_ends_at_ms: now + max_duration_ms,
            inactivity_ends_at_ms: now + inactivity_timeout_ms,
            participants: HashSet::new(),
            bot_turn_open: false,
            pending_transcription_turns: 0,
            pending_deferred_turns: 0,
            active_captures: HashMap::new(),
            transcript: Vec::new(),
        }
    }

    /// Record activity, pushing the inactivity deadline forward.
    pub fn touch(&mut self, inactivity_timeout_ms: u64) {
        let now = now_ms();
        self.last_activity_at_ms = now;
        self.inactivity_ends_at_ms = now + inactivity_timeout_ms;
    }

    /// Append or correct a transcript line. A correction replaces the
    /// most recent agent line rather than appending.
    pub fn push_transcript(&mut self, role: TranscriptRole, text: String, correction: bool) {
        if correction {
            if let Some(last) = self
                .transcript
                .iter_mut()
                .rev()
                .find(|line| line.role == TranscriptRole::Agent)
            {
                last.text = text;
                last.at_ms = now_ms();
                return;
            }
        }
        self.transcript.push(TranscriptLine {
            role,
            text,
            at_ms: now_ms(),
        });
    }
}

/// Error types for session management operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session for guild {0}")]
    NotFound(GuildId),
    #[error("Provider error: {0}")]
    Provider(#[from] crate::core::provider::ProviderError),
    #[error("Session mode owns no provider connection")]
    NoConnection,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(1, 10, 11, SessionMode::SegmentedPipeline, 60_000, 10_000)
    }

    #[test]
    fn correction_replaces_last_agent_line() {
        let mut s = session();
        s.push_transcript(TranscriptRole::User, "hi".into(), false);
        s.push_transcript(TranscriptRole::Agent, "helo ther".into(), false);
        s.push_transcript(TranscriptRole::Agent, "hello there".into(), true);

        assert_eq!(s.transcript.len(), 2);
        assert_eq!(s.transcript[1].text, "hello there");
    }

    #[test]
    fn correction_without_prior_agent_line_appends() {
        let mut s = session();
        s.push_transcript(TranscriptRole::Agent, "orphan".into(), true);
        assert_eq!(s.transcript.len(), 1);
    }

    #[test]
    fn touch_extends_inactivity_deadline() {
        let mut s = session();
        let before = s.inactivity_ends_at_ms;
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.touch(10_000);
        assert!(s.inactivity_ends_at_ms >= before);
    }
}
