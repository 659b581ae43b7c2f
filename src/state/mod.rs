use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ServerConfig;
use crate::core::capability::{CapabilityTokenManager, FrameSink, FrameSinkError, InjectedFrame};
use crate::core::session::{ChannelId, GuildId, VoiceSessionManager};

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub sessions: Arc<VoiceSessionManager>,
    pub capabilities: Arc<CapabilityTokenManager>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let sessions = VoiceSessionManager::new(config.session_manager_config());
        let sink = Arc::new(SessionFrameSink::new(sessions.clone()));
        let capabilities = Arc::new(CapabilityTokenManager::new(
            config.capability_config(),
            sessions.clone(),
            sink,
        ));
        // Session end revokes the guild's tokens through this hook
        sessions.set_token_revoker(capabilities.clone());

        Arc::new(Self {
            config,
            sessions,
            capabilities,
        })
    }
}

/// Frame consumer backed by the session layer. Playback resources are
/// lazily allocated per guild on the first `arm`.
pub struct SessionFrameSink {
    sessions: Arc<VoiceSessionManager>,
    armed: Mutex<HashSet<GuildId>>,
}

impl SessionFrameSink {
    pub fn new(sessions: Arc<VoiceSessionManager>) -> Self {
        Self {
            sessions,
            armed: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait::async_trait]
impl FrameSink for SessionFrameSink {
    async fn deliver(&self, frame: InjectedFrame) -> Result<(), FrameSinkError> {
        if !self.armed.lock().contains(&frame.guild_id) {
            return Err(FrameSinkError::NotArmed);
        }
        self.sessions
            .note_activity(frame.guild_id)
            .map_err(|e| FrameSinkError::Rejected(e.to_string()))?;
        debug!(
            "Delivered {} byte {} frame into guild {}",
            frame.data.len(),
            frame.mime_type,
            frame.guild_id
        );
        Ok(())
    }

    async fn arm(&self, guild_id: GuildId, _channel_id: ChannelId) -> Result<(), FrameSinkError> {
        self.armed.lock().insert(guild_id);
        Ok(())
    }
}
