//! Server configuration.

mod env;
mod validation;

use std::time::Duration;

use crate::core::capability::CapabilityConfig;
use crate::core::session::SessionManagerConfig;

pub use validation::ConfigError;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// WebSocket endpoint of the realtime speech provider
    pub provider_endpoint: String,
    pub provider_api_key: String,

    /// Persona instruction text sent at session initiation
    pub persona_instructions: String,
    pub persona_voice: String,

    pub session_max_duration_secs: u64,
    pub session_inactivity_timeout_secs: u64,
    pub latency_ring_capacity: usize,

    pub reconnect_max_attempts: u32,
    pub reconnect_base_backoff_ms: u64,

    pub capability_max_tokens: usize,
    pub capability_default_ttl_minutes: u64,
    pub capability_min_ttl_minutes: u64,
    pub capability_max_ttl_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            provider_endpoint: String::new(),
            provider_api_key: String::new(),
            persona_instructions: String::new(),
            persona_voice: "default".to_string(),
            session_max_duration_secs: 2 * 60 * 60,
            session_inactivity_timeout_secs: 10 * 60,
            latency_ring_capacity: crate::core::session::latency::DEFAULT_RING_CAPACITY,
            reconnect_max_attempts: 5,
            reconnect_base_backoff_ms: 500,
            capability_max_tokens: 256,
            capability_default_ttl_minutes: 12,
            capability_min_ttl_minutes: 2,
            capability_max_ttl_minutes: 30,
        }
    }
}

impl ServerConfig {
    /// Bind address string for the HTTP listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            provider_endpoint: self.provider_endpoint.clone(),
            provider_api_key: self.provider_api_key.clone(),
            instructions: self.persona_instructions.clone(),
            voice: self.persona_voice.clone(),
            max_duration: Duration::from_secs(self.session_max_duration_secs),
            inactivity_timeout: Duration::from_secs(self.session_inactivity_timeout_secs),
            reconnect_max_attempts: self.reconnect_max_attempts,
            reconnect_base_backoff: Duration::from_millis(self.reconnect_base_backoff_ms),
            latency_ring_capacity: self.latency_ring_capacity,
        }
    }

    pub fn capability_config(&self) -> CapabilityConfig {
        CapabilityConfig {
            max_tokens: self.capability_max_tokens,
            default_ttl: Duration::from_secs(self.capability_default_ttl_minutes * 60),
            min_ttl: Duration::from_secs(self.capability_min_ttl_minutes * 60),
            max_ttl: Duration::from_secs(self.capability_max_ttl_minutes * 60),
        }
    }
}
