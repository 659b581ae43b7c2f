//! Speech-agent provider adapter.
//!
//! The exemplar realtime provider: JSON control messages over a
//! persistent WebSocket. Audio, transcripts, pings and interruptions all
//! arrive as tagged text frames; there is no cancellation primitive on
//! this wire, so `cancel_active_response` is a declared no-op.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use super::base::{
    AudioInput, ProviderConnectionState, ProviderError, ProviderEvent, ProviderProtocolClient,
    ProviderSessionConfig,
};
use super::wire::{AudioFormat, InboundDispatcher, InitiationConfig, OutboundMessage};
use crate::utils::now_ms;

/// Configuration specific to the speech-agent provider
#[derive(Debug, Clone)]
pub struct SpeechAgentConfig {
    /// WebSocket endpoint, e.g. "wss://agents.example.com/v1/converse"
    pub endpoint: String,
    /// API key sent on the upgrade request
    pub api_key: String,
    /// Agent model identifier
    pub model: String,
    /// How long to wait for the initiation ack before giving up
    pub handshake_timeout: Duration,
    /// Absence of any inbound event for this long closes the socket
    pub liveness_window: Duration,
}

impl Default for SpeechAgentConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://agents.example.com/v1/converse".to_string(),
            api_key: String::new(),
            model: "converse-1".to_string(),
            handshake_timeout: Duration::from_secs(5),
            liveness_window: Duration::from_secs(45),
        }
    }
}

/// Speech-agent WebSocket client
pub struct SpeechAgentClient {
    config: SpeechAgentConfig,
    /// Connection state, shared with the TurnCoordinator
    state: Arc<RwLock<ProviderConnectionState>>,
    /// Sender for outbound wire messages
    outbound_tx: Option<mpsc::UnboundedSender<OutboundMessage>>,
    /// Shutdown signal sender
    shutdown_tx: Option<broadcast::Sender<()>>,
    /// Connection task handle
    connection_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SpeechAgentClient {
    pub fn new(config: SpeechAgentConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ProviderConnectionState::default())),
            outbound_tx: None,
            shutdown_tx: None,
            connection_handle: None,
        }
    }

    fn send_outbound(&self, message: OutboundMessage) -> Result<(), ProviderError> {
        let tx = self.outbound_tx.as_ref().ok_or(ProviderError::NotConnected)?;
        tx.send(message)
            .map_err(|_| ProviderError::NetworkError("Outbound channel closed".to_string()))
    }

    /// Run the socket loop until close, shutdown, or liveness expiry.
    async fn run_connection(
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        state: Arc<RwLock<ProviderConnectionState>>,
        dispatcher: InboundDispatcher,
        mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
        liveness_window: Duration,
    ) {
        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let mut liveness = tokio::time::interval(liveness_window / 4);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(message) = outbound_rx.recv() => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize outbound message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                        error!("Failed to send WebSocket message: {e}");
                        state.write().last_error = Some(e.to_string());
                        break;
                    }
                }

                message = ws_stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            dispatcher.dispatch_text(&text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // This provider never sends binary frames
                            warn!("Unexpected binary frame ({} bytes), ignoring", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Provider closed the connection: {frame:?}");
                            if let Some(frame) = frame {
                                let mut state = state.write();
                                state.last_close_code = Some(u16::from(frame.code));
                                state.last_close_reason = Some(frame.reason.to_string());
                            }
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/Pong frames are handled by tungstenite
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {e}");
                            state.write().last_error = Some(e.to_string());
                            break;
                        }
                        None => {
                            info!("Provider stream ended");
                            break;
                        }
                    }
                }

                _ = liveness.tick() => {
                    let last = state.read().last_event_at_ms;
                    if let Some(last) = last {
                        let silent = now_ms().saturating_sub(last);
                        if silent > liveness_window.as_millis() as u64 {
                            warn!("No provider event for {silent}ms, closing connection");
                            state.write().last_error =
                                Some(format!("Liveness window exceeded ({silent}ms)"));
                            break;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("Provider connection shutting down");
                    // Fire-and-forget close: do not wait for the
                    // provider's acknowledgment.
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        state.write().connected = false;
        info!("Speech-agent connection closed");
    }
}

#[async_trait::async_trait]
impl ProviderProtocolClient for SpeechAgentClient {
    async fn connect(
        &mut self,
        session_config: ProviderSessionConfig,
    ) -> Result<mpsc::UnboundedReceiver<ProviderEvent>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }

        let mut request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| ProviderError::ConfigurationError(format!("Invalid endpoint: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| ProviderError::ConfigurationError(format!("Invalid API key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        info!("Connected to speech-agent at {}", self.config.endpoint);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ProviderEvent>();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        {
            let mut state = self.state.write();
            *state = ProviderConnectionState::default();
            state.connected = true;
            state.connected_at_ms = Some(now_ms());
            state.last_event_at_ms = Some(now_ms());
        }

        // Initiation goes out before anything else on the wire.
        let initiation = OutboundMessage::Initiation {
            config: InitiationConfig {
                instructions: session_config.instructions,
                voice: session_config.voice,
                input_format: AudioFormat::linear16(session_config.input_sample_rate),
                output_format: AudioFormat::linear16(session_config.output_sample_rate),
            },
            prompt_override: session_config.prompt_override,
        };
        outbound_tx
            .send(initiation)
            .map_err(|_| ProviderError::NetworkError("Outbound channel closed".to_string()))?;

        let dispatcher =
            InboundDispatcher::new(self.state.clone(), outbound_tx.clone(), event_tx);
        let state = self.state.clone();
        let liveness_window = self.config.liveness_window;
        let connection_handle = tokio::spawn(Self::run_connection(
            ws_stream,
            state,
            dispatcher,
            outbound_rx,
            shutdown_rx,
            liveness_window,
        ));

        self.outbound_tx = Some(outbound_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.connection_handle = Some(connection_handle);

        // Wait for the initiation ack to carry the provider session id.
        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        loop {
            {
                let state = self.state.read();
                if state.session_id.is_some() {
                    break;
                }
                if !state.connected {
                    return Err(ProviderError::ConnectionFailed(
                        state
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "Connection closed during handshake".to_string()),
                    ));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::ConnectionFailed(
                    "Timed out waiting for initiation ack".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(
            "Speech-agent session established: {:?}",
            self.state.read().session_id
        );
        Ok(event_rx)
    }

    async fn disconnect(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
        self.outbound_tx = None;
        self.shutdown_tx = None;
        self.state.write().connected = false;
        info!("Disconnected from speech-agent");
    }

    fn append_input_audio(&self, audio: AudioInput) -> Result<(), ProviderError> {
        // One wire message per call, whatever the input form.
        self.send_outbound(OutboundMessage::AudioAppend {
            chunk: audio.into_base64(),
        })
    }

    fn commit_input_audio(&self) -> Result<(), ProviderError> {
        self.send_outbound(OutboundMessage::AudioCommit)
    }

    fn request_response(&self) -> Result<(), ProviderError> {
        self.send_outbound(OutboundMessage::ResponseNudge)
    }

    fn cancel_active_response(&self) -> bool {
        // The speech-agent wire has no cancellation primitive. Callers
        // must rely on the interruption signal instead.
        debug!("cancel_active_response is a no-op for speech-agent");
        false
    }

    fn is_ready(&self) -> bool {
        self.outbound_tx.is_some() && self.state.read().connected
    }

    fn connection_state(&self) -> ProviderConnectionState {
        self.state.read().clone()
    }

    fn state_handle(&self) -> Arc<RwLock<ProviderConnectionState>> {
        self.state.clone()
    }

    fn provider_info(&self) -> &'static str {
        "Speech-agent WebSocket v1"
    }
}

impl Drop for SpeechAgentClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
    }
}
