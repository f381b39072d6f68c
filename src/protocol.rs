//! Wire protocol for the game-session WebSocket.
//!
//! Every frame is an envelope of the form `{"type": ..., "data": {...}}`.
//! Inbound and outbound messages are modeled as tagged unions so that an
//! unrecognized message kind is an explicit `Unknown` case rather than a
//! silent fallthrough. Outbound frames additionally carry the session id
//! once the server has assigned one.

use serde::{Deserialize, Serialize};

use crate::state::{Evidence, GameState};

/// Messages received from the game server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot of the game state
    GameState { data: StatePayload },
    /// Full snapshot, delivered as an incremental-looking update
    GameStateUpdate { data: StatePayload },
    /// The server has started the game for this session
    GameStarted {
        #[serde(default)]
        data: Option<SessionPayload>,
    },
    /// One attributed line of AI narration or dialogue
    AiAction { data: AiActionPayload },
    /// Narrative phase transition, carrying the post-transition state
    PhaseChanged { data: PhaseChangedPayload },
    /// Voting has finished; any state change rides in the payload
    VotingComplete {
        #[serde(default)]
        data: Option<StatePayload>,
    },
    /// Final game outcome; any state change rides in the payload
    GameResult {
        #[serde(default)]
        data: Option<StatePayload>,
    },
    /// The session state has been cleared server-side
    GameReset,
    /// Server-reported error, surfaced as a non-fatal notice
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Any message kind this client does not recognize
    #[serde(other)]
    Unknown,
}

/// State-bearing payload; the session id may ride alongside the snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct StatePayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub state: GameState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiActionPayload {
    /// Speaker identity
    pub character: String,
    /// The spoken or narrated line
    pub action: String,
    /// Replaces the snapshot's evidence list when present
    #[serde(default)]
    pub discovered_evidence: Option<Vec<Evidence>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseChangedPayload {
    pub game_state: GameState,
}

impl ServerMessage {
    /// Session id carried by this message, if any. The connection manager
    /// adopts the first one it sees (late-binding session affinity).
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::GameState { data } | ServerMessage::GameStateUpdate { data } => {
                data.session_id.as_deref()
            }
            ServerMessage::GameStarted { data } => {
                data.as_ref().and_then(|d| d.session_id.as_deref())
            }
            ServerMessage::VotingComplete { data } | ServerMessage::GameResult { data } => {
                data.as_ref().and_then(|d| d.session_id.as_deref())
            }
            _ => None,
        }
    }
}

/// Messages sent to the game server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartGame { data: StartGamePayload },
    NextPhase,
    ResetGame,
    EditInstruction { data: EditInstructionPayload },
}

#[derive(Debug, Clone, Serialize)]
pub struct StartGamePayload {
    pub script_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditInstructionPayload {
    pub instruction: String,
    pub message_id: u64,
}

/// Outbound envelope: the message plus the session id once known.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    #[serde(flatten)]
    pub message: &'a ClientMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
}
