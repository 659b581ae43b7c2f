//! Turn coordination: derived bot state and barge-in handling.
//!
//! The coordinator stores nothing of its own. Bot state is a pure
//! function of session fields, recomputed on every mutation, so it can
//! never drift from the facts it is derived from.

use serde::Serialize;
use tracing::{debug, info};

use crate::core::provider::{ProviderConnectionState, ProviderProtocolClient};

/// Externally-visible conversational state of the bot in one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Disconnected,
}

/// Inputs to the state cascade, extracted from session fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnInputs {
    /// Whether the bot currently holds an open reply turn
    pub bot_turn_open: bool,
    /// User turns captured but not yet transcribed
    pub pending_transcription_turns: u32,
    /// Turns the provider has accepted but not yet begun answering
    pub provider_pending_turns: u32,
    /// Number of active input capture streams
    pub active_captures: usize,
    /// Whether the owned provider connection reports connected
    /// (`true` in segmented mode, which owns no connection)
    pub connected: bool,
}

/// Priority cascade over the session's raw signals. Ties resolve to the
/// earliest-listed state. A dead connection overrides everything else,
/// including an open bot turn: a session that lost its provider cannot
/// meaningfully be speaking.
pub fn derive_bot_state(inputs: TurnInputs) -> BotState {
    if !inputs.connected {
        BotState::Disconnected
    } else if inputs.bot_turn_open {
        BotState::Speaking
    } else if inputs.pending_transcription_turns + inputs.provider_pending_turns > 0 {
        BotState::Processing
    } else if inputs.active_captures > 0 {
        BotState::Listening
    } else {
        BotState::Idle
    }
}

/// Outcome of a barge-in attempt, for event publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargeIn {
    /// Whether an in-flight reply was actually superseded
    pub superseded: bool,
    /// Whether the provider accepted a cancellation request
    pub cancelled: bool,
}

/// Handle a new user turn arriving while a reply may be in flight.
///
/// If a reply is active it is marked superseded and, where the provider
/// supports it, cancelled. When cancellation is a no-op the outstanding
/// audio is left to finish playing concurrently with the new turn's
/// reply: last-turn-wins applies to content, not to the audio channel.
pub fn handle_barge_in(
    state: &mut ProviderConnectionState,
    client: Option<&dyn ProviderProtocolClient>,
) -> BargeIn {
    let Some(response_id) = state.active_response_id.take() else {
        return BargeIn {
            superseded: false,
            cancelled: false,
        };
    };

    state.reply_superseded_count += 1;
    let cancelled = client
        .map(|c| c.cancel_active_response())
        .unwrap_or(false);
    if cancelled {
        info!("Barge-in: cancelled in-flight reply {response_id}");
    } else {
        debug!("Barge-in: reply {response_id} superseded, audio left to finish");
    }
    BargeIn {
        superseded: true,
        cancelled,
    }
}
