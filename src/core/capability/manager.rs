//! Capability token store and lifecycle.
//!
//! All expiry and cap enforcement happens opportunistically inside
//! `grant` / `use_token` / `revoke` calls; correctness never depends on
//! a background sweeper. The token map lives behind a `parking_lot`
//! mutex that is released before any frame delivery await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::session::{ChannelId, GuildId, UserId};
use crate::utils::{fingerprint, now_ms};

use super::{FrameSink, FrameSinkError, GuildTokenRevoker, VoicePresence};

/// TTL bounds and capacity for the token store.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    pub max_tokens: usize,
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            default_ttl: Duration::from_secs(12 * 60),
            min_ttl: Duration::from_secs(2 * 60),
            max_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// One granted capability. The token string is the map key and is never
/// logged verbatim; audit events carry only its fingerprint.
#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub token: String,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub requester_id: UserId,
    pub target_id: UserId,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_used_at_ms: Option<u64>,
}

impl CapabilityToken {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at_ms
    }

    fn matches(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        requester_id: UserId,
        target_id: UserId,
    ) -> bool {
        self.guild_id == guild_id
            && self.channel_id == channel_id
            && self.requester_id == requester_id
            && self.target_id == target_id
    }
}

/// Result of a successful grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantOutcome {
    pub token: String,
    pub expires_at: u64,
    pub expires_in_minutes: u64,
}

/// Machine-readable grant rejections; `reason_code` feeds the wire
/// `reason` field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrantError {
    #[error("Requester is not in the voice channel")]
    RequesterNotPresent,
    #[error("Target is not in the voice channel")]
    TargetNotPresent,
}

impl GrantError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            GrantError::RequesterNotPresent => "requester_not_present",
            GrantError::TargetNotPresent => "target_not_present",
        }
    }
}

/// Machine-readable use-time rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UseError {
    #[error("Unknown token")]
    UnknownToken,
    #[error("Token expired")]
    Expired,
    #[error("Requester left the voice channel")]
    RequesterNotPresent,
    #[error("Target left the voice channel")]
    TargetNotPresent,
    #[error("Playback sink could not be armed")]
    NotArmed,
    #[error("Frame rejected: {0}")]
    SinkRejected(String),
}

impl UseError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            UseError::UnknownToken => "unknown_token",
            UseError::Expired => "expired",
            UseError::RequesterNotPresent => "requester_not_present",
            UseError::TargetNotPresent => "target_not_present",
            UseError::NotArmed => "not_armed",
            UseError::SinkRejected(_) => "sink_rejected",
        }
    }
}

/// One media frame pushed through a token.
#[derive(Debug, Clone)]
pub struct InjectedFrame {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub target_id: UserId,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Grants, validates, and revokes capability tokens.
pub struct CapabilityTokenManager {
    tokens: Mutex<HashMap<String, CapabilityToken>>,
    presence: Arc<dyn VoicePresence>,
    sink: Arc<dyn FrameSink>,
    config: CapabilityConfig,
}

impl CapabilityTokenManager {
    pub fn new(
        config: CapabilityConfig,
        presence: Arc<dyn VoicePresence>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            presence,
            sink,
            config,
        }
    }

    /// Grant a token for the (guild, channel, requester, target) tuple.
    ///
    /// Idempotent while a live token for the same tuple exists and both
    /// parties are still present; otherwise mints a fresh token with the
    /// requested TTL clamped to the configured bounds.
    pub fn grant(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        requester_id: UserId,
        target_id: UserId,
        ttl: Option<Duration>,
    ) -> Result<GrantOutcome, GrantError> {
        if !self.presence.is_present(guild_id, channel_id, requester_id) {
            return Err(GrantError::RequesterNotPresent);
        }
        if !self.presence.is_present(guild_id, channel_id, target_id) {
            return Err(GrantError::TargetNotPresent);
        }

        let now = now_ms();
        let mut tokens = self.tokens.lock();
        Self::sweep_expired(&mut tokens, now);

        if let Some(existing) = tokens
            .values()
            .find(|t| t.matches(guild_id, channel_id, requester_id, target_id))
        {
            debug!(
                "Reusing live capability token {} for guild {guild_id}",
                fingerprint(&existing.token)
            );
            return Ok(Self::outcome(existing, now));
        }

        let ttl = ttl
            .unwrap_or(self.config.default_ttl)
            .clamp(self.config.min_ttl, self.config.max_ttl);
        let token = CapabilityToken {
            token: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            guild_id,
            channel_id,
            requester_id,
            target_id,
            created_at_ms: now,
            expires_at_ms: now + ttl.as_millis() as u64,
            last_used_at_ms: None,
        };

        // Insertion-order cap: the oldest grant goes, not the least
        // recently used one
        while tokens.len() >= self.config.max_tokens {
            let oldest = tokens
                .values()
                .min_by_key(|t| t.created_at_ms)
                .map(|t| t.token.clone());
            match oldest {
                Some(key) => {
                    if let Some(evicted) = tokens.remove(&key) {
                        info!(
                            "Capability token {} evicted at capacity (guild {})",
                            fingerprint(&evicted.token),
                            evicted.guild_id
                        );
                    }
                }
                None => break,
            }
        }

        let outcome = Self::outcome(&token, now);
        info!(
            "Granted capability token {} for guild {guild_id} channel {channel_id} (expires in {}m)",
            fingerprint(&token.token),
            outcome.expires_in_minutes
        );
        tokens.insert(token.token.clone(), token);
        Ok(outcome)
    }

    /// Validate a token and deliver one frame through it.
    ///
    /// Expired entries are purged lazily, both parties' presence in the
    /// minting channel is re-checked, and a `NotArmed` sink failure gets
    /// exactly one arm-then-retry before it becomes the caller's error.
    pub async fn use_token(
        &self,
        token: &str,
        mime_type: String,
        data: Vec<u8>,
    ) -> Result<(), UseError> {
        let now = now_ms();
        let claimed = {
            let mut tokens = self.tokens.lock();
            Self::sweep_expired(&mut tokens, now);
            let Some(entry) = tokens.get_mut(token) else {
                return Err(UseError::UnknownToken);
            };
            if entry.is_expired(now) {
                // Unreachable after the sweep, but cheap to keep exact
                tokens.remove(token);
                return Err(UseError::Expired);
            }
            entry.last_used_at_ms = Some(now);
            entry.clone()
        };

        if !self
            .presence
            .is_present(claimed.guild_id, claimed.channel_id, claimed.requester_id)
        {
            self.revoke(token, "requester_not_present");
            return Err(UseError::RequesterNotPresent);
        }
        if !self
            .presence
            .is_present(claimed.guild_id, claimed.channel_id, claimed.target_id)
        {
            self.revoke(token, "target_not_present");
            return Err(UseError::TargetNotPresent);
        }

        let frame = InjectedFrame {
            guild_id: claimed.guild_id,
            channel_id: claimed.channel_id,
            target_id: claimed.target_id,
            mime_type,
            data,
        };

        match self.sink.deliver(frame.clone()).await {
            Ok(()) => Ok(()),
            Err(FrameSinkError::NotArmed) => {
                // Explicit two-step transition: arm once, retry once.
                debug!(
                    "Sink not armed for guild {}, arming and retrying once",
                    claimed.guild_id
                );
                self.sink
                    .arm(claimed.guild_id, claimed.channel_id)
                    .await
                    .map_err(|_| UseError::NotArmed)?;
                match self.sink.deliver(frame).await {
                    Ok(()) => Ok(()),
                    Err(FrameSinkError::NotArmed) => Err(UseError::NotArmed),
                    Err(FrameSinkError::Rejected(reason)) => Err(UseError::SinkRejected(reason)),
                }
            }
            Err(FrameSinkError::Rejected(reason)) => Err(UseError::SinkRejected(reason)),
        }
    }

    /// Revoke one token. Emits an audit line carrying the reason and the
    /// token fingerprint only.
    pub fn revoke(&self, token: &str, reason: &str) -> bool {
        let removed = self.tokens.lock().remove(token);
        match removed {
            Some(entry) => {
                info!(
                    "Revoked capability token {} for guild {}: {reason}",
                    fingerprint(&entry.token),
                    entry.guild_id
                );
                true
            }
            None => {
                warn!("Revoke of unknown token {}", fingerprint(token));
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    fn outcome(token: &CapabilityToken, now: u64) -> GrantOutcome {
        GrantOutcome {
            token: token.token.clone(),
            expires_at: token.expires_at_ms,
            expires_in_minutes: token.expires_at_ms.saturating_sub(now) / 60_000,
        }
    }

    fn sweep_expired(tokens: &mut HashMap<String, CapabilityToken>, now: u64) {
        tokens.retain(|_, t| {
            let keep = !t.is_expired(now);
            if !keep {
                debug!(
                    "Capability token {} expired (guild {})",
                    fingerprint(&t.token),
                    t.guild_id
                );
            }
            keep
        });
    }
}

impl GuildTokenRevoker for CapabilityTokenManager {
    fn revoke_guild(&self, guild_id: GuildId) -> usize {
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, t| {
            let keep = t.guild_id != guild_id;
            if !keep {
                info!(
                    "Revoked capability token {} for guild {guild_id}: session_ended",
                    fingerprint(&t.token)
                );
            }
            keep
        });
        before - tokens.len()
    }
}
