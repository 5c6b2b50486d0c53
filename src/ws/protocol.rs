//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::{Coord, GameError, Piece, Player, SessionSnapshot};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Bind this connection to a player slot and subscribe to the game
    Join { game_id: Uuid, player: Player },

    /// Propose a move. The mover is whoever this connection is bound as.
    Move {
        game_id: Uuid,
        from: Coord,
        to: Coord,
        /// Advisory only, used for an ownership sanity check
        #[serde(default)]
        piece: Option<Piece>,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        connection_id: Uuid,
        server_time: u64,
    },

    /// Full game state, sent to the whole game after every change
    GameUpdate(SessionSnapshot),

    /// Error targeted at the offending connection
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl From<&GameError> for ServerMsg {
    fn from(err: &GameError) -> Self {
        ServerMsg::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }
}
