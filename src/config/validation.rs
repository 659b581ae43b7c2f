use thiserror::Error;

use super::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },
    #[error("Missing required variable {0}")]
    Missing(&'static str),
}

impl ConfigError {
    pub(super) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name,
            message: message.into(),
        }
    }
}

/// Cross-field checks run after every field parsed individually.
pub(super) fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    if !config.provider_endpoint.is_empty()
        && !config.provider_endpoint.starts_with("ws://")
        && !config.provider_endpoint.starts_with("wss://")
    {
        return Err(ConfigError::invalid(
            "PROVIDER_ENDPOINT",
            "must be a ws:// or wss:// URL",
        ));
    }
    if config.session_max_duration_secs == 0 {
        return Err(ConfigError::invalid(
            "SESSION_MAX_DURATION_SECS",
            "must be greater than zero",
        ));
    }
    if config.session_inactivity_timeout_secs > config.session_max_duration_secs {
        return Err(ConfigError::invalid(
            "SESSION_INACTIVITY_TIMEOUT_SECS",
            "must not exceed the session max duration",
        ));
    }
    if config.latency_ring_capacity == 0 {
        return Err(ConfigError::invalid(
            "LATENCY_RING_CAPACITY",
            "must be greater than zero",
        ));
    }
    if config.capability_max_tokens == 0 {
        return Err(ConfigError::invalid(
            "CAPABILITY_MAX_TOKENS",
            "must be greater than zero",
        ));
    }
    if config.capability_min_ttl_minutes > config.capability_max_ttl_minutes {
        return Err(ConfigError::invalid(
            "CAPABILITY_MIN_TTL_MINUTES",
            "must not exceed CAPABILITY_MAX_TTL_MINUTES",
        ));
    }
    if config.capability_default_ttl_minutes < config.capability_min_ttl_minutes
        || config.capability_default_ttl_minutes > config.capability_max_ttl_minutes
    {
        return Err(ConfigError::invalid(
            "CAPABILITY_DEFAULT_TTL_MINUTES",
            "must fall within the min/max TTL bounds",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn http_provider_endpoint_is_rejected() {
        let config = ServerConfig {
            provider_endpoint: "https://provider.example/realtime".to_string(),
            ..Default::default()
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn inactivity_timeout_may_not_exceed_max_duration() {
        let config = ServerConfig {
            session_max_duration_secs: 60,
            session_inactivity_timeout_secs: 120,
            ..Default::default()
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn default_ttl_outside_bounds_is_rejected() {
        let config = ServerConfig {
            capability_default_ttl_minutes: 60,
            ..Default::default()
        };
        assert!(validate(&config).is_err());
    }
}
