//! Provider protocol clients.
//!
//! One client instance per active session owns one persistent connection
//! to a realtime speech provider and normalizes its event vocabulary.

pub mod base;
pub mod speech_agent;
pub mod wire;

pub use base::{
    AudioInput, ProviderConnectionState, ProviderError, ProviderEvent, ProviderKind,
    ProviderProtocolClient, ProviderSessionConfig, ResponseStatus, create_provider_client,
};
pub use speech_agent::{SpeechAgentClient, SpeechAgentConfig};
pub use wire::{AudioFormat, InboundDispatcher, InboundMessage, OutboundMessage, TranscriptSubtype};
