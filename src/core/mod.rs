pub mod capability;
pub mod provider;
pub mod session;

// Re-export commonly used types for convenience
pub use provider::{
    AudioInput, ProviderConnectionState, ProviderError, ProviderEvent, ProviderKind,
    ProviderProtocolClient, ProviderSessionConfig, ResponseStatus, create_provider_client,
};

pub use session::{
    BotState, EndReason, LatencyTracker, SessionEvent, SessionManagerConfig, SessionMode,
    SessionSnapshot, VoiceSessionManager,
};

pub use capability::{
    CapabilityConfig, CapabilityTokenManager, FrameSink, GrantOutcome, VoicePresence,
};
