use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use super::wire::{AudioFormat, TranscriptSubtype};

/// Error types for provider protocol operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Terminal state of a generated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Interrupted,
}

/// Normalized events every provider adapter emits, delivered through an
/// explicit per-session channel and drained strictly in arrival order.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Chunk of synthesized reply audio, base64.
    AudioDelta { chunk: String },
    /// Transcript of either side, tagged with its wire subtype.
    Transcript {
        subtype: TranscriptSubtype,
        text: String,
    },
    /// Terminal state of a generated reply.
    ResponseDone { status: ResponseStatus },
    /// Non-fatal provider-reported error.
    Error { message: String },
}

/// Connection-level state owned by a provider client and read by the
/// TurnCoordinator. Mutated only by the owning client's dispatch path.
#[derive(Debug, Clone, Default)]
pub struct ProviderConnectionState {
    pub connected: bool,
    /// Provider-issued session id from the initiation ack
    pub session_id: Option<String>,
    pub connected_at_ms: Option<u64>,
    pub last_event_at_ms: Option<u64>,
    /// Sample rates as negotiated by the provider, not as requested
    pub negotiated_input: Option<AudioFormat>,
    pub negotiated_output: Option<AudioFormat>,
    /// Identifies an in-flight generated reply, if any
    pub active_response_id: Option<String>,
    pub active_response_status: Option<ResponseStatus>,
    /// Incremented every time an in-flight reply is cancelled by a newer
    /// user turn
    pub reply_superseded_count: u64,
    pub last_error: Option<String>,
    pub last_close_code: Option<u16>,
    pub last_close_reason: Option<String>,
}

/// Session-level configuration passed to `connect`.
#[derive(Debug, Clone)]
pub struct ProviderSessionConfig {
    /// Instruction / system-prompt text for the persona
    pub instructions: String,
    /// Per-session prompt override, if any
    pub prompt_override: Option<String>,
    /// Voice or style selector
    pub voice: String,
    /// Requested input sample rate in Hz
    pub input_sample_rate: u32,
    /// Requested output sample rate in Hz
    pub output_sample_rate: u32,
}

impl Default for ProviderSessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            prompt_override: None,
            voice: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        }
    }
}

/// Input audio for `append_input_audio`: either raw bytes (encoded to
/// base64 internally) or a pre-encoded base64 string passed through
/// unchanged. Either way, exactly one outbound wire message results.
#[derive(Debug, Clone)]
pub enum AudioInput {
    Raw(Vec<u8>),
    Base64(String),
}

impl AudioInput {
    /// Normalize to the base64 payload carried on the wire.
    pub fn into_base64(self) -> String {
        match self {
            AudioInput::Raw(bytes) => BASE64.encode(bytes),
            AudioInput::Base64(encoded) => encoded,
        }
    }
}

impl From<Vec<u8>> for AudioInput {
    fn from(bytes: Vec<u8>) -> Self {
        AudioInput::Raw(bytes)
    }
}

/// Client-side contract every realtime provider adapter satisfies.
///
/// One instance owns one persistent connection. The adapter translates
/// the provider's native event vocabulary into [`ProviderEvent`]s and
/// accepts normalized audio/control commands. Socket-level close flips
/// `connected:false` and closes the event channel; the owning session
/// manager decides whether to reconnect or end the session — the client
/// never self-reconnects.
#[async_trait::async_trait]
pub trait ProviderProtocolClient: Send + Sync {
    /// Open the persistent connection and run the initiation handshake.
    /// Returns the session's ordered event stream.
    async fn connect(
        &mut self,
        config: ProviderSessionConfig,
    ) -> Result<mpsc::UnboundedReceiver<ProviderEvent>, ProviderError>;

    /// Close the connection without waiting for provider acknowledgment.
    async fn disconnect(&mut self);

    /// Buffer audio into the provider's input stream without flushing.
    fn append_input_audio(&self, audio: AudioInput) -> Result<(), ProviderError>;

    /// Signal end-of-utterance, flushing buffered audio.
    fn commit_input_audio(&self) -> Result<(), ProviderError>;

    /// Nudge the provider to begin generating a reply. Only needed for
    /// providers that do not infer turn boundaries themselves.
    fn request_response(&self) -> Result<(), ProviderError>;

    /// Attempt to cancel an in-flight generated reply. Providers whose
    /// wire protocol has no cancellation primitive return `false`
    /// unconditionally; callers must then rely on the interruption
    /// signal instead.
    fn cancel_active_response(&self) -> bool;

    /// Whether the connection is established and usable.
    fn is_ready(&self) -> bool;

    /// Snapshot of the connection state record.
    fn connection_state(&self) -> ProviderConnectionState;

    /// Shared handle to the live connection state, read by the
    /// TurnCoordinator.
    fn state_handle(&self) -> Arc<RwLock<ProviderConnectionState>>;

    /// Provider-specific information string.
    fn provider_info(&self) -> &'static str;
}

/// Closed set of realtime providers selectable at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// The speech-agent exemplar: JSON control messages over a WebSocket
    SpeechAgent,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::SpeechAgent => "speech_agent",
        }
    }
}

/// Create a provider client for the given kind.
pub fn create_provider_client(
    kind: ProviderKind,
    endpoint: String,
    api_key: String,
) -> Box<dyn ProviderProtocolClient> {
    match kind {
        ProviderKind::SpeechAgent => Box::new(
            super::speech_agent::SpeechAgentClient::new(super::speech_agent::SpeechAgentConfig {
                endpoint,
                api_key,
                ..Default::default()
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_audio_normalizes_to_base64() {
        let bytes = vec![0u8, 1, 2, 253, 254, 255];
        let expected = BASE64.encode(&bytes);
        assert_eq!(AudioInput::Raw(bytes).into_base64(), expected);
    }

    #[test]
    fn preencoded_audio_passes_through_unchanged() {
        let encoded = "cGNtIGRhdGE=".to_string();
        assert_eq!(AudioInput::Base64(encoded.clone()).into_base64(), encoded);
    }

    #[test]
    fn connection_state_defaults_to_disconnected() {
        let state = ProviderConnectionState::default();
        assert!(!state.connected);
        assert!(state.session_id.is_none());
        assert_eq!(state.reply_superseded_count, 0);
    }
}
