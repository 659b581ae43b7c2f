//! Normalized provider wire vocabulary and inbound dispatch.
//!
//! Concrete message names vary per provider; adapters translate their
//! native framing into these shapes so the rest of the session layer
//! never sees provider-specific JSON. The inbound dispatch state machine
//! lives here because it is identical across providers: only the
//! transport and the outer message names differ.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::base::{ProviderConnectionState, ProviderEvent, ResponseStatus};
use crate::utils::now_ms;

/// Negotiated audio format for one direction of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Encoding name, e.g. "linear16"
    pub encoding: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn linear16(sample_rate: u32) -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate,
        }
    }
}

/// Transcript subtypes carried on inbound transcript messages.
///
/// A correction replaces the prior agent transcript for the same
/// utterance rather than appending a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSubtype {
    User,
    Agent,
    AgentCorrection,
}

/// Agent-level configuration carried on the initiation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiationConfig {
    /// System-prompt / instruction text for the persona
    pub instructions: String,
    /// Voice or style selector
    pub voice: String,
    /// Requested input format (the provider may coerce it in the ack)
    pub input_format: AudioFormat,
    /// Requested output format (the provider may coerce it in the ack)
    pub output_format: AudioFormat,
}

/// Outbound wire messages (client → provider).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Connection handshake carrying agent config and an optional
    /// per-session prompt override.
    Initiation {
        #[serde(flatten)]
        config: InitiationConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt_override: Option<String>,
    },
    /// Buffer one chunk of input audio without flushing.
    AudioAppend { chunk: String },
    /// End-of-utterance: flush buffered input audio.
    AudioCommit,
    /// Nudge the provider to begin generating a reply. This is an
    /// activity message, not a content message.
    ResponseNudge,
    /// Liveness echo carrying the ping's correlation id.
    Pong { correlation_id: u64 },
}

/// Inbound wire messages (provider → client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Handshake acknowledgment carrying the provider session id and the
    /// sample rates the provider actually negotiated.
    InitiationAck {
        session_id: String,
        input_format: AudioFormat,
        output_format: AudioFormat,
    },
    /// Chunk of synthesized reply audio, base64.
    Audio { chunk: String },
    /// Transcript of either side of the conversation.
    Transcript {
        subtype: TranscriptSubtype,
        text: String,
    },
    /// Liveness probe; must be echoed as a pong with the same id.
    Ping { correlation_id: u64 },
    /// The in-flight reply was superseded by a newer user turn.
    Interruption,
}

/// Inbound message dispatcher shared by provider adapters.
///
/// Translates wire messages into [`ProviderEvent`]s in receipt order and
/// maintains the connection-state record the TurnCoordinator reads.
/// Everything here is synchronous: the outbound and event channels are
/// unbounded so dispatch never suspends, preserving ordering.
pub struct InboundDispatcher {
    state: Arc<RwLock<ProviderConnectionState>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    events: mpsc::UnboundedSender<ProviderEvent>,
}

impl InboundDispatcher {
    pub fn new(
        state: Arc<RwLock<ProviderConnectionState>>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Self {
        Self {
            state,
            outbound,
            events,
        }
    }

    /// Parse and dispatch one raw text frame. Malformed frames are
    /// logged and dropped; they never tear down the session.
    pub fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                warn!("Dropping malformed provider message: {e}");
            }
        }
    }

    /// Dispatch one decoded inbound message.
    pub fn dispatch(&self, message: InboundMessage) {
        {
            let mut state = self.state.write();
            state.last_event_at_ms = Some(now_ms());
        }

        match message {
            InboundMessage::InitiationAck {
                session_id,
                input_format,
                output_format,
            } => {
                debug!(
                    "Provider session {} established ({}/{} Hz)",
                    session_id, input_format.sample_rate, output_format.sample_rate
                );
                let mut state = self.state.write();
                state.session_id = Some(session_id);
                // Rates come from the ack, never from the request: the
                // provider may have coerced them.
                state.negotiated_input = Some(input_format);
                state.negotiated_output = Some(output_format);
            }
            InboundMessage::Audio { chunk } => {
                self.emit(ProviderEvent::AudioDelta { chunk });
            }
            InboundMessage::Transcript { subtype, text } => {
                self.emit(ProviderEvent::Transcript { subtype, text });
            }
            InboundMessage::Ping { correlation_id } => {
                // Echo immediately with the same correlation id. A failed
                // send is logged but must not itself disconnect: only
                // event silence beyond the liveness window does that.
                if self
                    .outbound
                    .send(OutboundMessage::Pong { correlation_id })
                    .is_err()
                {
                    warn!("Pong {correlation_id} not sent: outbound channel closed");
                }
            }
            InboundMessage::Interruption => {
                {
                    let mut state = self.state.write();
                    state.reply_superseded_count += 1;
                    state.active_response_id = None;
                    state.active_response_status = Some(ResponseStatus::Interrupted);
                }
                self.emit(ProviderEvent::ResponseDone {
                    status: ResponseStatus::Interrupted,
                });
            }
        }
    }

    fn emit(&self, event: ProviderEvent) {
        if self.events.send(event).is_err() {
            debug!("Provider event dropped: session receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (
        InboundDispatcher,
        Arc<RwLock<ProviderConnectionState>>,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedReceiver<ProviderEvent>,
    ) {
        let state = Arc::new(RwLock::new(ProviderConnectionState::default()));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let d = InboundDispatcher::new(state.clone(), out_tx, ev_tx);
        (d, state, out_rx, ev_rx)
    }

    #[test]
    fn initiation_ack_stores_negotiated_rates() {
        let (d, state, _out, _ev) = dispatcher();
        d.dispatch(InboundMessage::InitiationAck {
            session_id: "sess-42".to_string(),
            input_format: AudioFormat::linear16(16000),
            output_format: AudioFormat::linear16(24000),
        });

        let state = state.read();
        assert_eq!(state.session_id.as_deref(), Some("sess-42"));
        assert_eq!(state.negotiated_input.as_ref().unwrap().sample_rate, 16000);
        assert_eq!(state.negotiated_output.as_ref().unwrap().sample_rate, 24000);
        assert!(state.last_event_at_ms.is_some());
    }

    #[test]
    fn ping_yields_exactly_one_pong_with_same_id() {
        let (d, _state, mut out, mut ev) = dispatcher();
        d.dispatch(InboundMessage::Ping { correlation_id: 7 });

        assert_eq!(
            out.try_recv().unwrap(),
            OutboundMessage::Pong { correlation_id: 7 }
        );
        assert!(out.try_recv().is_err(), "expected exactly one pong");
        assert!(ev.try_recv().is_err(), "ping must have no other side effect");
    }

    #[test]
    fn interruption_emits_response_done_and_increments_superseded() {
        let (d, state, _out, mut ev) = dispatcher();
        d.dispatch(InboundMessage::Interruption);

        match ev.try_recv().unwrap() {
            ProviderEvent::ResponseDone { status } => {
                assert_eq!(status, ResponseStatus::Interrupted);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(ev.try_recv().is_err());
        assert_eq!(state.read().reply_superseded_count, 1);

        d.dispatch(InboundMessage::Interruption);
        assert_eq!(state.read().reply_superseded_count, 2);
    }

    #[test]
    fn audio_and_transcripts_pass_through_in_order() {
        let (d, _state, _out, mut ev) = dispatcher();
        d.dispatch(InboundMessage::Transcript {
            subtype: TranscriptSubtype::User,
            text: "hello there".to_string(),
        });
        d.dispatch(InboundMessage::Audio {
            chunk: "AAAA".to_string(),
        });
        d.dispatch(InboundMessage::Transcript {
            subtype: TranscriptSubtype::AgentCorrection,
            text: "hi, hello".to_string(),
        });

        assert!(matches!(
            ev.try_recv().unwrap(),
            ProviderEvent::Transcript {
                subtype: TranscriptSubtype::User,
                ..
            }
        ));
        assert!(matches!(
            ev.try_recv().unwrap(),
            ProviderEvent::AudioDelta { .. }
        ));
        assert!(matches!(
            ev.try_recv().unwrap(),
            ProviderEvent::Transcript {
                subtype: TranscriptSubtype::AgentCorrection,
                ..
            }
        ));
    }

    #[test]
    fn malformed_json_is_dropped_without_events() {
        let (d, _state, mut out, mut ev) = dispatcher();
        d.dispatch_text("{\"type\": \"audio\", \"chunk\": 12}");
        d.dispatch_text("not json at all");
        assert!(out.try_recv().is_err());
        assert!(ev.try_recv().is_err());
    }

    #[test]
    fn wire_messages_round_trip_tagged_json() {
        let msg = OutboundMessage::AudioAppend {
            chunk: "cGNt".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"audio_append\""));

        let parsed: InboundMessage =
            serde_json::from_str("{\"type\":\"interruption\"}").unwrap();
        assert_eq!(parsed, InboundMessage::Interruption);
    }
}
