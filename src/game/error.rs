//! Game error taxonomy shared by the gateway and HTTP routes

use super::board::Player;

/// Errors from game operations. All are recoverable and leave session state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("Game not found")]
    NotFound,

    #[error("{0} slot is already taken")]
    SlotTaken(Player),

    #[error("It's not your turn")]
    NotYourTurn,

    #[error("Illegal move")]
    IllegalMove,

    #[error("Game is not in progress")]
    GameNotInProgress,

    #[error("Too many messages, slow down")]
    RateLimited,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GameError {
    /// Stable wire code for the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::SlotTaken(_) => "slot_taken",
            Self::NotYourTurn => "not_your_turn",
            Self::IllegalMove => "illegal_move",
            Self::GameNotInProgress => "game_not_in_progress",
            Self::RateLimited => "rate_limited",
            Self::Validation(_) => "validation",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show a client; internal details stay in the logs
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Server error".to_string(),
            other => other.to_string(),
        }
    }
}
