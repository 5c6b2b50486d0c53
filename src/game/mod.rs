//! Game modules: board, move rules, sessions and the session registry

pub mod board;
pub mod error;
pub mod registry;
pub mod rules;
pub mod session;

pub use board::{Board, Coord, Piece, PieceKind, Player};
pub use error::GameError;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{
    ConnectionId, GameSession, Phase, ReconnectPolicy, SessionSnapshot, SlotBinding, SlotStatus,
    Slots,
};
