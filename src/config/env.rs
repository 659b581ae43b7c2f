use std::env;
use std::str::FromStr;

use super::validation::{self, ConfigError};
use super::ServerConfig;

impl ServerConfig {
    /// Load configuration from environment variables, with sensible
    /// defaults. Also loads from a `.env` file if one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = ServerConfig::default();
        let config = ServerConfig {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,
            provider_endpoint: env::var("PROVIDER_ENDPOINT").unwrap_or_default(),
            provider_api_key: env::var("PROVIDER_API_KEY").unwrap_or_default(),
            persona_instructions: env::var("PERSONA_INSTRUCTIONS").unwrap_or_default(),
            persona_voice: env::var("PERSONA_VOICE").unwrap_or(defaults.persona_voice),
            session_max_duration_secs: parse_var(
                "SESSION_MAX_DURATION_SECS",
                defaults.session_max_duration_secs,
            )?,
            session_inactivity_timeout_secs: parse_var(
                "SESSION_INACTIVITY_TIMEOUT_SECS",
                defaults.session_inactivity_timeout_secs,
            )?,
            latency_ring_capacity: parse_var(
                "LATENCY_RING_CAPACITY",
                defaults.latency_ring_capacity,
            )?,
            reconnect_max_attempts: parse_var(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            reconnect_base_backoff_ms: parse_var(
                "RECONNECT_BASE_BACKOFF_MS",
                defaults.reconnect_base_backoff_ms,
            )?,
            capability_max_tokens: parse_var(
                "CAPABILITY_MAX_TOKENS",
                defaults.capability_max_tokens,
            )?,
            capability_default_ttl_minutes: parse_var(
                "CAPABILITY_DEFAULT_TTL_MINUTES",
                defaults.capability_default_ttl_minutes,
            )?,
            capability_min_ttl_minutes: parse_var(
                "CAPABILITY_MIN_TTL_MINUTES",
                defaults.capability_min_ttl_minutes,
            )?,
            capability_max_ttl_minutes: parse_var(
                "CAPABILITY_MAX_TTL_MINUTES",
                defaults.capability_max_ttl_minutes,
            )?,
        };

        validation::validate(&config)?;
        Ok(config)
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}
