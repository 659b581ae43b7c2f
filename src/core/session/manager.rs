//! VoiceSessionManager: one realtime session per guild.
//!
//! The manager owns the guild → session map. Each native-realtime
//! session also owns a provider client plus a drive task that drains the
//! client's event channel strictly in arrival order, keeps turn and
//! latency state current, and enforces the session's two deadlines.
//! Monitoring consumers observe everything through a broadcast channel;
//! they never reach into session state directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::core::capability::{GuildTokenRevoker, VoicePresence};
use crate::core::provider::{
    AudioInput, ProviderConnectionState, ProviderEvent, ProviderProtocolClient,
    ProviderSessionConfig, ResponseStatus, TranscriptSubtype, create_provider_client,
};
use crate::utils::now_ms;

use super::events::{SessionEvent, SessionSnapshot};
use super::latency::{LatencyTracker, Stage, TurnRef};
use super::turn::{TurnInputs, derive_bot_state, handle_barge_in};
use super::types::{
    CaptureHandle, ChannelId, EndReason, GuildId, Session, SessionError, SessionMode,
    TranscriptRole, UserId,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables shared by every session the manager starts.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub provider_endpoint: String,
    pub provider_api_key: String,
    /// Persona instruction text sent at initiation
    pub instructions: String,
    pub voice: String,
    pub max_duration: Duration,
    pub inactivity_timeout: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_backoff: Duration,
    pub latency_ring_capacity: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            provider_endpoint: String::new(),
            provider_api_key: String::new(),
            instructions: String::new(),
            voice: "default".to_string(),
            max_duration: Duration::from_secs(2 * 60 * 60),
            inactivity_timeout: Duration::from_secs(10 * 60),
            reconnect_max_attempts: 5,
            reconnect_base_backoff: Duration::from_millis(500),
            latency_ring_capacity: super::latency::DEFAULT_RING_CAPACITY,
        }
    }
}

/// Everything one live session owns. Sync locks guard plain state and
/// are never held across an await; the provider client sits behind an
/// async mutex because `connect`/`disconnect` suspend.
pub struct SessionHandle {
    session: SyncRwLock<Session>,
    latency: SyncRwLock<LatencyTracker>,
    client: Mutex<Option<Box<dyn ProviderProtocolClient>>>,
    /// Shared view of the client's connection state, captured once at
    /// connect so readers never need the async mutex
    provider_state: SyncRwLock<Option<Arc<SyncRwLock<ProviderConnectionState>>>>,
    /// Latency turn currently awaiting its pipeline boundaries, paired
    /// with the participant who committed it
    open_turn: SyncRwLock<Option<(TurnRef, UserId)>>,
    provider_config: ProviderSessionConfig,
    shutdown: broadcast::Sender<()>,
}

impl SessionHandle {
    fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.read();
        let connected = match session.mode.owns_connection() {
            true => self
                .provider_state
                .read()
                .as_ref()
                .map(|state| state.read().connected)
                .unwrap_or(false),
            false => true,
        };
        let bot_state = derive_bot_state(TurnInputs {
            bot_turn_open: session.bot_turn_open,
            pending_transcription_turns: session.pending_transcription_turns,
            provider_pending_turns: session.pending_deferred_turns,
            active_captures: session.active_captures.len(),
            connected,
        });
        SessionSnapshot {
            session_id: session.session_id.clone(),
            guild_id: session.guild_id.to_string(),
            voice_channel_id: session.voice_channel_id.to_string(),
            text_channel_id: session.text_channel_id.to_string(),
            mode: session.mode,
            bot_state,
            participant_count: session.participants.len(),
            participants: session.participants.iter().map(|id| id.to_string()).collect(),
            started_at_ms: session.started_at_ms,
            last_activity_at_ms: session.last_activity_at_ms,
            max_ends_at_ms: session.max_ends_at_ms,
            inactivity_ends_at_ms: session.inactivity_ends_at_ms,
            bot_turn_open: session.bot_turn_open,
            pending_transcription_turns: session.pending_transcription_turns,
            pending_deferred_turns: session.pending_deferred_turns,
            active_capture_count: session.active_captures.len(),
            latency: self.latency.read().averages(),
            transcript: session.transcript.clone(),
        }
    }
}

/// Manages at most one voice session per guild.
pub struct VoiceSessionManager {
    sessions: SyncRwLock<HashMap<GuildId, Arc<SessionHandle>>>,
    config: SessionManagerConfig,
    events: broadcast::Sender<SessionEvent>,
    /// Set after construction so the capability layer and session layer
    /// can reference each other without a cycle at build time
    token_revoker: SyncRwLock<Option<Arc<dyn GuildTokenRevoker>>>,
    /// Handle to self for the drive tasks; never upgraded while ending
    weak: Weak<Self>,
}

impl VoiceSessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            sessions: SyncRwLock::new(HashMap::new()),
            config,
            events,
            token_revoker: SyncRwLock::new(None),
            weak: weak.clone(),
        })
    }

    /// Wire in the capability manager used for revoke-on-end.
    pub fn set_token_revoker(&self, revoker: Arc<dyn GuildTokenRevoker>) {
        *self.token_revoker.write() = revoker.into();
    }

    /// Subscribe to monitoring events. Lagging subscribers drop events;
    /// they never apply backpressure to sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session for the guild, or return the existing one.
    ///
    /// At most one session exists per guild; a second `start` while one
    /// is live is a no-op that returns the live session's snapshot.
    pub async fn start(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
        mode: SessionMode,
    ) -> Result<SessionSnapshot, SessionError> {
        if let Some(existing) = self.sessions.read().get(&guild_id) {
            debug!("Session already live for guild {guild_id}, returning it");
            return Ok(existing.snapshot());
        }

        let session = Session::new(
            guild_id,
            voice_channel_id,
            text_channel_id,
            mode,
            self.config.max_duration.as_millis() as u64,
            self.config.inactivity_timeout.as_millis() as u64,
        );
        let session_id = session.session_id.clone();
        let (shutdown, _) = broadcast::channel(1);
        let handle = Arc::new(SessionHandle {
            session: SyncRwLock::new(session),
            latency: SyncRwLock::new(LatencyTracker::new(self.config.latency_ring_capacity)),
            client: Mutex::new(None),
            provider_state: SyncRwLock::new(None),
            open_turn: SyncRwLock::new(None),
            provider_config: ProviderSessionConfig {
                instructions: self.config.instructions.clone(),
                prompt_override: None,
                voice: self.config.voice.clone(),
                ..Default::default()
            },
            shutdown,
        });

        let events_rx = if let SessionMode::NativeRealtime { provider } = mode {
            let mut client = create_provider_client(
                provider,
                self.config.provider_endpoint.clone(),
                self.config.provider_api_key.clone(),
            );
            let rx = client.connect(handle.provider_config.clone()).await?;
            *handle.provider_state.write() = Some(client.state_handle());
            *handle.client.lock().await = Some(client);
            Some(rx)
        } else {
            None
        };

        // Raced start for the same guild: first insert wins, the loser
        // tears its connection back down.
        {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&guild_id) {
                let existing = existing.clone();
                drop(sessions);
                if let Some(client) = handle.client.lock().await.as_mut() {
                    client.disconnect().await;
                }
                return Ok(existing.snapshot());
            }
            sessions.insert(guild_id, handle.clone());
        }

        info!(
            "Started session {session_id} for guild {guild_id} in channel {voice_channel_id}"
        );
        self.spawn_drive(guild_id, handle.clone(), events_rx);
        let snapshot = handle.snapshot();
        let _ = self.events.send(SessionEvent::SessionStarted {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// End the guild's session. The provider connection is closed
    /// fire-and-forget; the guild's capability tokens are revoked before
    /// this returns.
    pub async fn end(&self, guild_id: GuildId, reason: EndReason) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .remove(&guild_id)
            .ok_or(SessionError::NotFound(guild_id))?;

        // Terminal snapshot before any teardown mutates state
        let snapshot = handle.snapshot();
        let session_id = snapshot.session_id.clone();
        let _ = handle.shutdown.send(());

        // Close without waiting for provider acknowledgment
        let teardown = handle.clone();
        tokio::spawn(async move {
            if let Some(client) = teardown.client.lock().await.as_mut() {
                client.disconnect().await;
            }
        });

        // Tokens die with the session, not lazily on next use
        let revoker = self.token_revoker.read().clone();
        if let Some(revoker) = revoker {
            let revoked = revoker.revoke_guild(guild_id);
            if revoked > 0 {
                info!("Revoked {revoked} capability token(s) for guild {guild_id} on session end");
            }
        }

        info!("Ended session {session_id} for guild {guild_id}: {reason:?}");
        let _ = self.events.send(SessionEvent::SessionEnded {
            guild_id: guild_id.to_string(),
            session_id,
            reason,
            snapshot,
        });
        Ok(())
    }

    /// Apply a voice-channel join or leave observed from the platform
    /// gateway.
    pub fn apply_participant_change(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        joined: bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle(guild_id)?;
        {
            let mut session = handle.session.write();
            if joined {
                session.participants.insert(user_id);
            } else {
                session.participants.remove(&user_id);
                // A user who left can no longer be captured
                session.active_captures.remove(&user_id);
            }
            let timeout = self.config.inactivity_timeout.as_millis() as u64;
            session.touch(timeout);
        }
        let snapshot = handle.snapshot();
        let _ = self.events.send(SessionEvent::Snapshot {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Open an input capture stream for a participant.
    pub fn begin_capture(&self, guild_id: GuildId, user_id: UserId) -> Result<(), SessionError> {
        let handle = self.handle(guild_id)?;
        let mut session = handle.session.write();
        session
            .active_captures
            .entry(user_id)
            .or_insert_with(|| CaptureHandle::new(user_id));
        session.touch(self.config.inactivity_timeout.as_millis() as u64);
        Ok(())
    }

    /// Forward captured audio into the provider's input buffer.
    pub async fn push_audio(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        audio: AudioInput,
    ) -> Result<(), SessionError> {
        let handle = self.handle(guild_id)?;
        {
            let mut session = handle.session.write();
            if let Some(capture) = session.active_captures.get_mut(&user_id) {
                capture.last_frame_at_ms = now_ms();
            }
        }
        let client = handle.client.lock().await;
        let client = client.as_ref().ok_or(SessionError::NoConnection)?;
        client.append_input_audio(audio)?;
        Ok(())
    }

    /// Close a participant's capture and hand the buffered utterance to
    /// the provider as a completed user turn. Any in-flight reply is
    /// superseded first (last turn wins).
    pub async fn commit_capture(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<(), SessionError> {
        let handle = self.handle(guild_id)?;
        // Resolve the connection before touching any session counters:
        // a rejected commit must leave the session exactly as it was.
        let client = handle.client.lock().await;
        let client = client.as_ref().ok_or(SessionError::NoConnection)?;

        let barge_in = {
            let state_handle = client.state_handle();
            let mut state = state_handle.write();
            handle_barge_in(&mut state, Some(client.as_ref()))
        };
        if barge_in.superseded {
            let mut session = handle.session.write();
            session.bot_turn_open = false;
            let _ = self.events.send(SessionEvent::Interruption {
                guild_id: guild_id.to_string(),
                superseded_response_id: None,
            });
        }

        client.commit_input_audio()?;
        client.request_response()?;
        {
            // The wire carries no response id; mint a local one so a
            // later barge-in has something to supersede.
            let state_handle = client.state_handle();
            let mut state = state_handle.write();
            state.active_response_id = Some(uuid::Uuid::new_v4().to_string());
            state.active_response_status = None;
        }

        let captured_at = {
            let mut session = handle.session.write();
            let capture = session.active_captures.remove(&user_id);
            session.pending_transcription_turns += 1;
            session.pending_deferred_turns += 1;
            session.touch(self.config.inactivity_timeout.as_millis() as u64);
            capture.map(|c| c.started_at_ms).unwrap_or_else(now_ms)
        };

        // A newer turn abandons whatever latency turn was still open
        let turn = {
            let mut latency = handle.latency.write();
            if let Some((stale, _)) = handle.open_turn.write().take() {
                latency.abandon(stale);
            }
            latency.begin_turn(captured_at)
        };
        *handle.open_turn.write() = Some((turn, user_id));
        Ok(())
    }

    /// Record externally-driven activity (e.g. an injected media frame)
    /// so it counts against the inactivity deadline.
    pub fn note_activity(&self, guild_id: GuildId) -> Result<(), SessionError> {
        let handle = self.handle(guild_id)?;
        handle
            .session
            .write()
            .touch(self.config.inactivity_timeout.as_millis() as u64);
        Ok(())
    }

    pub fn get_snapshot(&self, guild_id: GuildId) -> Result<SessionSnapshot, SessionError> {
        Ok(self.handle(guild_id)?.snapshot())
    }

    pub fn list_snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        handles.iter().map(|h| h.snapshot()).collect()
    }

    fn handle(&self, guild_id: GuildId) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .read()
            .get(&guild_id)
            .cloned()
            .ok_or(SessionError::NotFound(guild_id))
    }

    fn spawn_drive(
        &self,
        guild_id: GuildId,
        handle: Arc<SessionHandle>,
        events_rx: Option<tokio::sync::mpsc::UnboundedReceiver<ProviderEvent>>,
    ) {
        let manager = self.weak.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let mut shutdown_rx = handle.shutdown.subscribe();
        tokio::spawn(async move {
            let mut events_rx = events_rx;
            let mut progress = ReplyProgress::default();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => {
                        let expired = {
                            let session = handle.session.read();
                            let now = now_ms();
                            if now >= session.max_ends_at_ms {
                                Some(EndReason::MaxDuration)
                            } else if now >= session.inactivity_ends_at_ms {
                                Some(EndReason::InactivityTimeout)
                            } else {
                                None
                            }
                        };
                        if let Some(reason) = expired {
                            if let Some(manager) = manager.upgrade() {
                                let _ = manager.end(guild_id, reason).await;
                            }
                            break;
                        }
                    }
                    event = recv_provider_event(&mut events_rx) => {
                        match event {
                            Some(event) => {
                                drive_event(&handle, &events, guild_id, event, &mut progress);
                            }
                            None => {
                                // Channel closed: the connection died.
                                match reconnect(&handle, &config, guild_id).await {
                                    Some(rx) => {
                                        events_rx = Some(rx);
                                        progress = ReplyProgress::default();
                                    }
                                    None => {
                                        if let Some(manager) = manager.upgrade() {
                                            let _ = manager
                                                .end(guild_id, EndReason::ProviderFatal)
                                                .await;
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            debug!("Drive task for guild {guild_id} exited");
        });
    }
}

impl VoicePresence for VoiceSessionManager {
    fn is_present(&self, guild_id: GuildId, channel_id: ChannelId, user_id: UserId) -> bool {
        let Some(handle) = self.sessions.read().get(&guild_id).cloned() else {
            return false;
        };
        let session = handle.session.read();
        session.voice_channel_id == channel_id && session.participants.contains(&user_id)
    }
}

/// Pending when the session owns no connection, so segmented-pipeline
/// drive tasks still run their deadline timer.
async fn recv_provider_event(
    rx: &mut Option<tokio::sync::mpsc::UnboundedReceiver<ProviderEvent>>,
) -> Option<ProviderEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Which latency boundaries the current reply has already crossed.
#[derive(Debug, Default)]
struct ReplyProgress {
    generation_marked: bool,
    audio_marked: bool,
}

fn drive_event(
    handle: &SessionHandle,
    events: &broadcast::Sender<SessionEvent>,
    guild_id: GuildId,
    event: ProviderEvent,
    progress: &mut ReplyProgress,
) {
    let open_turn = *handle.open_turn.read();
    match event {
        ProviderEvent::Transcript { subtype, text } => match subtype {
            TranscriptSubtype::User => {
                if let Some((turn, _)) = open_turn {
                    handle
                        .latency
                        .write()
                        .mark_stage(turn, Stage::TranscriptionStart, now_ms());
                }
                {
                    let mut session = handle.session.write();
                    session.pending_transcription_turns =
                        session.pending_transcription_turns.saturating_sub(1);
                    session.push_transcript(TranscriptRole::User, text.clone(), false);
                }
                let user_id = open_turn
                    .map(|(_, user)| user.to_string())
                    .unwrap_or_default();
                let _ = events.send(SessionEvent::TurnIn {
                    guild_id: guild_id.to_string(),
                    user_id,
                    text: Some(text),
                });
            }
            TranscriptSubtype::Agent | TranscriptSubtype::AgentCorrection => {
                if !progress.generation_marked {
                    progress.generation_marked = true;
                    if let Some((turn, _)) = open_turn {
                        handle
                            .latency
                            .write()
                            .mark_stage(turn, Stage::GenerationStart, now_ms());
                    }
                }
                handle.session.write().push_transcript(
                    TranscriptRole::Agent,
                    text,
                    subtype == TranscriptSubtype::AgentCorrection,
                );
            }
        },
        ProviderEvent::AudioDelta { .. } => {
            if !progress.audio_marked {
                progress.audio_marked = true;
                if let Some((turn, _)) = open_turn {
                    handle
                        .latency
                        .write()
                        .mark_stage(turn, Stage::AudioStart, now_ms());
                }
                handle.session.write().bot_turn_open = true;
            }
        }
        ProviderEvent::ResponseDone { status } => {
            if let Some(state) = handle.provider_state.read().as_ref() {
                let mut state = state.write();
                state.active_response_id = None;
                state.active_response_status = Some(status);
            }
            {
                let mut session = handle.session.write();
                session.bot_turn_open = false;
                session.pending_deferred_turns = session.pending_deferred_turns.saturating_sub(1);
                session.last_activity_at_ms = now_ms();
            }
            if let Some((turn, _)) = handle.open_turn.write().take() {
                handle.latency.write().finalize(turn);
            }
            *progress = ReplyProgress::default();
            match status {
                ResponseStatus::Completed => {
                    let last_agent_line = {
                        let session = handle.session.read();
                        session
                            .transcript
                            .iter()
                            .rev()
                            .find(|line| line.role == TranscriptRole::Agent)
                            .map(|line| line.text.clone())
                    };
                    let _ = events.send(SessionEvent::TurnOut {
                        guild_id: guild_id.to_string(),
                        text: last_agent_line,
                    });
                }
                ResponseStatus::Interrupted => {
                    let _ = events.send(SessionEvent::Interruption {
                        guild_id: guild_id.to_string(),
                        superseded_response_id: None,
                    });
                }
            }
        }
        ProviderEvent::Error { message } => {
            warn!("Provider error in guild {guild_id} session: {message}");
        }
    }
}

/// Bounded reconnect with exponential backoff. Returns the new event
/// receiver, or `None` once the attempt budget is spent.
async fn reconnect(
    handle: &SessionHandle,
    config: &SessionManagerConfig,
    guild_id: GuildId,
) -> Option<tokio::sync::mpsc::UnboundedReceiver<ProviderEvent>> {
    for attempt in 1..=config.reconnect_max_attempts {
        let backoff = config.reconnect_base_backoff * 2u32.saturating_pow(attempt - 1);
        warn!(
            "Provider connection lost for guild {guild_id}, reconnect attempt {attempt}/{} in {backoff:?}",
            config.reconnect_max_attempts
        );
        tokio::time::sleep(backoff).await;

        let mut client = handle.client.lock().await;
        let Some(client) = client.as_mut() else {
            return None;
        };
        match client.connect(handle.provider_config.clone()).await {
            Ok(rx) => {
                *handle.provider_state.write() = Some(client.state_handle());
                info!("Reconnected provider for guild {guild_id} on attempt {attempt}");
                return Some(rx);
            }
            Err(err) => {
                error!("Reconnect attempt {attempt} failed for guild {guild_id}: {err}");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::ProviderKind;

    fn manager() -> Arc<VoiceSessionManager> {
        VoiceSessionManager::new(SessionManagerConfig::default())
    }

    #[tokio::test]
    async fn start_is_idempotent_per_guild() {
        let manager = manager();
        let first = manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        let second = manager
            .start(1, 99, 99, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
        // The second call did not clobber the original channel ids
        assert_eq!(second.voice_channel_id, "10");
    }

    #[tokio::test]
    async fn end_removes_session_and_publishes_terminal_snapshot() {
        let manager = manager();
        let mut events = manager.subscribe();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        manager.end(1, EndReason::ExplicitLeave).await.unwrap();

        assert!(manager.get_snapshot(1).is_err());
        let mut saw_ended = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SessionEnded { reason, .. } = event {
                assert_eq!(reason, EndReason::ExplicitLeave);
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn end_of_unknown_guild_is_an_error() {
        let manager = manager();
        assert!(matches!(
            manager.end(42, EndReason::ExplicitLeave).await,
            Err(SessionError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn participant_changes_update_presence() {
        let manager = manager();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        manager.apply_participant_change(1, 7, true).unwrap();
        assert!(manager.is_present(1, 10, 7));
        // Wrong channel is not presence
        assert!(!manager.is_present(1, 12, 7));

        let snapshot = manager.apply_participant_change(1, 7, false).unwrap();
        assert_eq!(snapshot.participant_count, 0);
        assert!(!manager.is_present(1, 10, 7));
    }

    #[tokio::test]
    async fn leaving_participant_loses_active_capture() {
        let manager = manager();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        manager.apply_participant_change(1, 7, true).unwrap();
        manager.begin_capture(1, 7).unwrap();
        assert_eq!(manager.get_snapshot(1).unwrap().active_capture_count, 1);

        let snapshot = manager.apply_participant_change(1, 7, false).unwrap();
        assert_eq!(snapshot.active_capture_count, 0);
    }

    #[tokio::test]
    async fn segmented_session_reports_listening_while_capturing() {
        let manager = manager();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        manager.begin_capture(1, 7).unwrap();
        let snapshot = manager.get_snapshot(1).unwrap();
        assert_eq!(snapshot.bot_state, crate::core::session::turn::BotState::Listening);
    }

    #[tokio::test]
    async fn rejected_commit_leaves_session_counters_untouched() {
        let manager = manager();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        manager.apply_participant_change(1, 7, true).unwrap();
        manager.begin_capture(1, 7).unwrap();

        // Segmented sessions own no connection, so the commit is refused
        assert!(matches!(
            manager.commit_capture(1, 7).await,
            Err(SessionError::NoConnection)
        ));

        let snapshot = manager.get_snapshot(1).unwrap();
        assert_eq!(snapshot.pending_transcription_turns, 0);
        assert_eq!(snapshot.pending_deferred_turns, 0);
        // The capture survives the rejected commit
        assert_eq!(snapshot.active_capture_count, 1);
    }

    #[tokio::test]
    async fn turn_in_event_names_the_committing_user() {
        let manager = manager();
        manager
            .start(1, 10, 11, SessionMode::SegmentedPipeline)
            .await
            .unwrap();
        let handle = manager.handle(1).unwrap();
        let turn = handle.latency.write().begin_turn(now_ms());
        *handle.open_turn.write() = Some((turn, 7));

        let mut events = manager.subscribe();
        let mut progress = ReplyProgress::default();
        drive_event(
            &handle,
            &manager.events,
            1,
            ProviderEvent::Transcript {
                subtype: TranscriptSubtype::User,
                text: "hello there".to_string(),
            },
            &mut progress,
        );

        let mut saw_turn_in = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::TurnIn { user_id, .. } = event {
                assert_eq!(user_id, "7");
                saw_turn_in = true;
            }
        }
        assert!(saw_turn_in);
    }

    #[tokio::test]
    async fn native_start_without_reachable_provider_fails() {
        let manager = VoiceSessionManager::new(SessionManagerConfig {
            provider_endpoint: "ws://127.0.0.1:1/realtime".to_string(),
            provider_api_key: "key".to_string(),
            ..Default::default()
        });
        let result = manager
            .start(
                1,
                10,
                11,
                SessionMode::NativeRealtime {
                    provider: ProviderKind::SpeechAgent,
                },
            )
            .await;
        assert!(result.is_err());
        assert!(manager.get_snapshot(1).is_err());
    }
}
