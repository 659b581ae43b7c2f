//! Ephemeral capability tokens for guest media injection.
//!
//! A token authorizes one (requester, target) pair to push frames into
//! one guild voice channel for a bounded window. Presence in the minting
//! channel is the real credential; the token only names the pair, and it
//! is re-checked on every use.

pub mod manager;

pub use manager::{
    CapabilityConfig, CapabilityToken, CapabilityTokenManager, GrantError, GrantOutcome,
    InjectedFrame, UseError,
};

use crate::core::session::{ChannelId, GuildId, UserId};

/// Who is currently in which voice channel. Implemented by the session
/// manager; injected so token managers can be tested in isolation.
pub trait VoicePresence: Send + Sync {
    fn is_present(&self, guild_id: GuildId, channel_id: ChannelId, user_id: UserId) -> bool;
}

/// Downstream consumer of injected frames (the playback pipeline).
///
/// `deliver` may fail with `NotArmed` when the consumer exists but has
/// not allocated its playback resources yet; callers then `arm` once and
/// retry exactly once.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync {
    async fn deliver(&self, frame: InjectedFrame) -> Result<(), FrameSinkError>;

    /// Allocate playback resources for the channel.
    async fn arm(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), FrameSinkError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameSinkError {
    #[error("Sink not armed")]
    NotArmed,
    #[error("Frame rejected: {0}")]
    Rejected(String),
}

/// Revocation hook the session manager calls when a session ends.
pub trait GuildTokenRevoker: Send + Sync {
    /// Revoke every token minted for the guild. Returns how many.
    fn revoke_guild(&self, guild_id: GuildId) -> usize;
}
