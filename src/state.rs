//! Game-state snapshots and the reducer that folds inbound messages
//! into them.
//!
//! Snapshots are immutable: every relevant message produces a whole new
//! `GameState` rather than mutating the previous one in place. A
//! `game_reset` starts a new generation, represented as `None`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

/// Narrative stage of the mystery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    Introduction,
    Investigation,
    Discussion,
    Voting,
    Revelation,
    /// Phase name this client does not recognize; kept non-fatal so a
    /// server-side addition does not break the reducer.
    #[serde(other)]
    Other,
}

/// One attributed line of dialogue or narration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeEvent {
    pub speaker: String,
    pub content: String,
}

/// A piece of discovered evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
}

/// Immutable snapshot of one session generation's state.
///
/// The event list is append-only across successive snapshots of the same
/// generation; consumers rely on that monotonicity (see [`LogCursor`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    #[serde(default)]
    pub current_phase: GamePhase,
    #[serde(default)]
    pub events: Vec<NarrativeEvent>,
    #[serde(default)]
    pub discovered_evidence: Option<Vec<Evidence>>,
}

/// Outcome of folding one message into the current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// Message had no effect on the snapshot
    Unchanged,
    /// Snapshot replaced wholesale
    Replace(GameState),
    /// New generation: snapshot becomes empty
    Clear,
}

/// Fold one inbound message into the previous snapshot.
///
/// Pure: no side effects, no mutation of `prev`. Side effects that
/// accompany certain messages (voice-mapping refresh, TTS enqueue,
/// notices) are the session facade's job.
pub fn reduce(prev: Option<&GameState>, msg: &ServerMessage) -> Reduction {
    match msg {
        ServerMessage::GameState { data } | ServerMessage::GameStateUpdate { data } => {
            Reduction::Replace(data.state.clone())
        }
        ServerMessage::PhaseChanged { data } => Reduction::Replace(data.game_state.clone()),
        ServerMessage::AiAction { data } => {
            let mut next = prev.cloned().unwrap_or_default();
            next.events.push(NarrativeEvent {
                speaker: data.character.clone(),
                content: data.action.clone(),
            });
            // Evidence is replace-if-present, never merged
            if data.discovered_evidence.is_some() {
                next.discovered_evidence = data.discovered_evidence.clone();
            }
            Reduction::Replace(next)
        }
        ServerMessage::GameReset => Reduction::Clear,
        ServerMessage::VotingComplete { data } | ServerMessage::GameResult { data } => {
            // Informational; a state change only happens if the payload
            // carries its own snapshot
            match data {
                Some(payload) => Reduction::Replace(payload.state.clone()),
                None => Reduction::Unchanged,
            }
        }
        ServerMessage::GameStarted { .. } | ServerMessage::Error { .. } => Reduction::Unchanged,
        ServerMessage::Unknown => {
            warn!("Ignoring unrecognized server message");
            Reduction::Unchanged
        }
    }
}

/// Tracks how many narrative events have already been handed to the UI,
/// so a wholesale state replace that re-delivers already-seen events does
/// not render duplicates.
#[derive(Debug, Default)]
pub struct LogCursor {
    rendered: usize,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The suffix of `state.events` that has not been handed out yet.
    /// Advances the cursor past everything returned.
    pub fn take_new<'a>(&mut self, state: &'a GameState) -> &'a [NarrativeEvent] {
        if state.events.len() < self.rendered {
            // Event lists are monotone within a generation; a shorter list
            // means a frame we should not re-render from
            debug!(
                "Event list shrank ({} < {}); nothing new to render",
                state.events.len(),
                self.rendered
            );
            return &[];
        }
        let new = &state.events[self.rendered..];
        self.rendered = state.events.len();
        new
    }

    /// Reset at a generation boundary (`game_reset` or script change).
    pub fn reset(&mut self) {
        self.rendered = 0;
    }

    pub fn rendered(&self) -> usize {
        self.rendered
    }
}
