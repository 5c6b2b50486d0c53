//! Game session - authoritative state of one match

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::board::{Board, Coord, Player};
use super::error::GameError;
use super::rules;

/// Identity of one realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Only one slot populated
    WaitingForOpponent,
    /// Both slots populated, moves accepted
    InProgress,
    /// Terminal: every connection left and none came back
    Abandoned,
}

/// Whether a vacated slot may be claimed by a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Allow,
    Deny,
}

/// Binding state of one player slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "connection", rename_all = "snake_case")]
pub enum SlotBinding {
    /// Never claimed
    Open,
    /// Claimed through the lifecycle API, no connection yet
    Reserved,
    /// Bound to a live connection
    Connected(ConnectionId),
    /// A connection was bound and has dropped
    Vacated,
}

impl SlotBinding {
    pub fn is_populated(&self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn status(&self) -> SlotStatus {
        match self {
            Self::Open => SlotStatus::Open,
            Self::Reserved => SlotStatus::Reserved,
            Self::Connected(_) => SlotStatus::Connected,
            Self::Vacated => SlotStatus::Vacated,
        }
    }
}

/// Client-facing slot state (connection ids are never exposed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Open,
    Reserved,
    Connected,
    Vacated,
}

/// Both player slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slots<T> {
    pub player_a: T,
    pub player_b: T,
}

impl<T> Slots<T> {
    pub fn get(&self, player: Player) -> &T {
        match player {
            Player::PlayerA => &self.player_a,
            Player::PlayerB => &self.player_b,
        }
    }

    pub fn get_mut(&mut self, player: Player) -> &mut T {
        match player {
            Player::PlayerA => &mut self.player_a,
            Player::PlayerB => &mut self.player_b,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Player, &T)> {
        [
            (Player::PlayerA, &self.player_a),
            (Player::PlayerB, &self.player_b),
        ]
        .into_iter()
    }
}

/// Immutable view of a session sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub game_id: Uuid,
    pub join_code: String,
    pub board: Board,
    /// Only present while the game is in progress
    pub current_player: Option<Player>,
    pub phase: Phase,
    pub players: Slots<SlotStatus>,
    pub version: u64,
}

/// The authoritative record of one match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSession {
    pub(crate) id: Uuid,
    pub(crate) join_code: String,
    pub(crate) board: Board,
    pub(crate) players: Slots<SlotBinding>,
    pub(crate) current_player: Player,
    pub(crate) phase: Phase,
    pub(crate) version: u64,
    pub(crate) created_at: DateTime<Utc>,
    /// Set while no slot holds a live connection
    pub(crate) idle_since: Option<Instant>,
}

impl GameSession {
    /// New session with the initiating player's slot reserved
    pub fn new(id: Uuid, join_code: String, initiator: Player) -> Self {
        let mut players = Slots {
            player_a: SlotBinding::Open,
            player_b: SlotBinding::Open,
        };
        *players.get_mut(initiator) = SlotBinding::Reserved;

        Self {
            id,
            join_code,
            board: Board::opening(),
            players,
            current_player: Player::PlayerA,
            phase: Phase::WaitingForOpponent,
            version: 0,
            created_at: Utc::now(),
            idle_since: Some(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn join_code(&self) -> &str {
        &self.join_code
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn slot(&self, player: Player) -> SlotBinding {
        *self.players.get(player)
    }

    /// Bind a live connection to a player slot
    pub fn join(
        &mut self,
        player: Player,
        connection: ConnectionId,
        policy: ReconnectPolicy,
    ) -> Result<SessionSnapshot, GameError> {
        if self.phase == Phase::Abandoned {
            return Err(GameError::GameNotInProgress);
        }

        match *self.players.get(player) {
            SlotBinding::Connected(existing) if existing == connection => {
                return Ok(self.snapshot());
            }
            SlotBinding::Connected(_) => return Err(GameError::SlotTaken(player)),
            SlotBinding::Vacated if policy == ReconnectPolicy::Deny => {
                return Err(GameError::SlotTaken(player));
            }
            SlotBinding::Open | SlotBinding::Reserved | SlotBinding::Vacated => {}
        }

        *self.players.get_mut(player) = SlotBinding::Connected(connection);
        self.idle_since = None;
        self.maybe_start();
        self.version += 1;
        Ok(self.snapshot())
    }

    /// Claim an open slot without a connection (lifecycle API join)
    pub fn reserve(&mut self, player: Player) -> Result<SessionSnapshot, GameError> {
        if self.phase == Phase::Abandoned {
            return Err(GameError::GameNotInProgress);
        }
        if self.players.get(player).is_populated() {
            return Err(GameError::SlotTaken(player));
        }

        *self.players.get_mut(player) = SlotBinding::Reserved;
        self.maybe_start();
        self.version += 1;
        Ok(self.snapshot())
    }

    /// Vacate `player`'s slot if `connection` holds it. Returns whether it did.
    pub fn release(&mut self, player: Player, connection: ConnectionId) -> bool {
        if *self.players.get(player) != SlotBinding::Connected(connection) {
            return false;
        }

        *self.players.get_mut(player) = SlotBinding::Vacated;
        if !self.has_live_connection() {
            self.idle_since = Some(Instant::now());
        }
        self.version += 1;
        true
    }

    /// Validate and apply a move in one step
    pub fn apply_move(
        &mut self,
        mover: Player,
        from: Coord,
        to: Coord,
    ) -> Result<SessionSnapshot, GameError> {
        if self.phase != Phase::InProgress {
            return Err(GameError::GameNotInProgress);
        }
        if mover != self.current_player {
            return Err(GameError::NotYourTurn);
        }
        if !rules::is_legal(&self.board, mover, from, to) {
            return Err(GameError::IllegalMove);
        }

        // is_legal guarantees a piece at `from`
        let piece = self.board.get(from).ok_or(GameError::IllegalMove)?;
        self.board.place(to, piece);
        self.current_player = mover.other();
        self.version += 1;
        Ok(self.snapshot())
    }

    pub fn has_live_connection(&self) -> bool {
        self.players.iter().any(|(_, binding)| binding.is_live())
    }

    /// Number of live connections bound to this session
    pub fn live_connections(&self) -> usize {
        self.players
            .iter()
            .filter(|(_, binding)| binding.is_live())
            .count()
    }

    /// How long the session has had no live connection
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since.map(|since| since.elapsed())
    }

    pub fn mark_abandoned(&mut self) {
        if self.phase != Phase::Abandoned {
            self.phase = Phase::Abandoned;
            self.version += 1;
        }
    }

    /// Drop live connection bindings, used when a session is loaded from storage
    pub(crate) fn detach_connections(&mut self) {
        for player in [Player::PlayerA, Player::PlayerB] {
            let slot = self.players.get_mut(player);
            if slot.is_live() {
                *slot = SlotBinding::Vacated;
            }
        }
        self.idle_since = Some(Instant::now());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            game_id: self.id,
            join_code: self.join_code.clone(),
            board: self.board.clone(),
            current_player: (self.phase == Phase::InProgress).then_some(self.current_player),
            phase: self.phase,
            players: Slots {
                player_a: self.players.player_a.status(),
                player_b: self.players.player_b.status(),
            },
            version: self.version,
        }
    }

    fn maybe_start(&mut self) {
        if self.phase == Phase::WaitingForOpponent
            && self.players.iter().all(|(_, binding)| binding.is_populated())
        {
            self.phase = Phase::InProgress;
            self.current_player = Player::PlayerA;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::{Piece, PieceKind};

    fn started() -> (GameSession, ConnectionId, ConnectionId) {
        let mut session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        session.join(Player::PlayerA, a, ReconnectPolicy::Allow).unwrap();
        session.join(Player::PlayerB, b, ReconnectPolicy::Allow).unwrap();
        (session, a, b)
    }

    #[test]
    fn new_session_waits_with_initiator_reserved() {
        let session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::WaitingForOpponent);
        assert_eq!(snapshot.current_player, None);
        assert_eq!(snapshot.players.player_a, SlotStatus::Reserved);
        assert_eq!(snapshot.players.player_b, SlotStatus::Open);
    }

    #[test]
    fn second_slot_starts_the_game_exactly_once() {
        let mut session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        let a = ConnectionId::new();

        let first = session.join(Player::PlayerA, a, ReconnectPolicy::Allow).unwrap();
        assert_eq!(first.phase, Phase::WaitingForOpponent);

        let second = session
            .join(Player::PlayerB, ConnectionId::new(), ReconnectPolicy::Allow)
            .unwrap();
        assert_eq!(second.phase, Phase::InProgress);
        assert_eq!(second.current_player, Some(Player::PlayerA));

        // A move, then a reconnect, must not reset the turn
        session
            .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
            .unwrap();
        assert!(session.release(Player::PlayerA, a));
        let rejoined = session
            .join(Player::PlayerA, ConnectionId::new(), ReconnectPolicy::Allow)
            .unwrap();
        assert_eq!(rejoined.current_player, Some(Player::PlayerB));
    }

    #[test]
    fn third_join_on_live_slots_is_rejected() {
        let (mut session, _, _) = started();
        let before = session.clone();
        for player in [Player::PlayerA, Player::PlayerB] {
            let err = session
                .join(player, ConnectionId::new(), ReconnectPolicy::Allow)
                .unwrap_err();
            assert_eq!(err, GameError::SlotTaken(player));
        }
        assert_eq!(session, before);
    }

    #[test]
    fn rejoin_with_same_connection_is_idempotent() {
        let (mut session, a, _) = started();
        let version = session.version;
        session.join(Player::PlayerA, a, ReconnectPolicy::Allow).unwrap();
        assert_eq!(session.version, version);
    }

    #[test]
    fn vacated_slot_respects_reconnect_policy() {
        let (mut session, a, _) = started();
        assert!(session.release(Player::PlayerA, a));
        assert_eq!(session.slot(Player::PlayerA), SlotBinding::Vacated);

        let err = session
            .join(Player::PlayerA, ConnectionId::new(), ReconnectPolicy::Deny)
            .unwrap_err();
        assert_eq!(err, GameError::SlotTaken(Player::PlayerA));

        assert!(session
            .join(Player::PlayerA, ConnectionId::new(), ReconnectPolicy::Allow)
            .is_ok());
    }

    #[test]
    fn reserve_only_claims_open_slots() {
        let mut session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        assert_eq!(
            session.reserve(Player::PlayerA).unwrap_err(),
            GameError::SlotTaken(Player::PlayerA)
        );
        let snapshot = session.reserve(Player::PlayerB).unwrap();
        assert_eq!(snapshot.phase, Phase::InProgress);
        assert_eq!(
            session.reserve(Player::PlayerB).unwrap_err(),
            GameError::SlotTaken(Player::PlayerB)
        );
    }

    #[test]
    fn moves_rejected_before_opponent_joins() {
        let mut session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        let err = session
            .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
            .unwrap_err();
        assert_eq!(err, GameError::GameNotInProgress);
    }

    #[test]
    fn out_of_turn_move_leaves_state_unchanged() {
        let (mut session, _, _) = started();
        let before = session.clone();
        let err = session
            .apply_move(Player::PlayerB, Coord::new(4, 0), Coord::new(3, 0))
            .unwrap_err();
        assert_eq!(err, GameError::NotYourTurn);
        assert_eq!(session, before);
    }

    #[test]
    fn legal_move_relocates_and_flips_turn() {
        let (mut session, _, _) = started();
        let pawn = session.board().get(Coord::new(0, 0)).unwrap();

        let snapshot = session
            .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
            .unwrap();

        assert_eq!(snapshot.current_player, Some(Player::PlayerB));
        assert_eq!(snapshot.board.get(Coord::new(0, 0)), None);
        assert_eq!(snapshot.board.get(Coord::new(1, 1)), Some(pawn));
    }

    #[test]
    fn capture_replaces_destination() {
        let (mut session, _, _) = started();
        let mut board = Board::empty();
        let attacker = Piece::new(Player::PlayerA, PieceKind::Hero3, 1);
        let victim = Piece::new(Player::PlayerB, PieceKind::Pawn, 1);
        board.place(Coord::new(0, 0), attacker);
        board.place(Coord::new(2, 1), victim);
        session.board = board;

        let snapshot = session
            .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(2, 1))
            .unwrap();
        assert_eq!(snapshot.board.get(Coord::new(2, 1)), Some(attacker));
        assert_eq!(snapshot.board.pieces().count(), 1);
    }

    #[test]
    fn moving_opponent_piece_is_illegal_and_harmless() {
        let (mut session, _, _) = started();
        session
            .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
            .unwrap();
        let before = session.clone();

        let err = session
            .apply_move(Player::PlayerB, Coord::new(1, 1), Coord::new(2, 1))
            .unwrap_err();
        assert_eq!(err, GameError::IllegalMove);
        assert_eq!(session, before);
    }

    #[test]
    fn abandoned_session_refuses_everything() {
        let (mut session, a, b) = started();
        session.release(Player::PlayerA, a);
        session.release(Player::PlayerB, b);
        assert!(!session.has_live_connection());
        session.mark_abandoned();

        assert_eq!(session.phase(), Phase::Abandoned);
        assert_eq!(
            session
                .join(Player::PlayerA, ConnectionId::new(), ReconnectPolicy::Allow)
                .unwrap_err(),
            GameError::GameNotInProgress
        );
        assert_eq!(
            session
                .apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
                .unwrap_err(),
            GameError::GameNotInProgress
        );
    }

    #[test]
    fn release_only_frees_the_named_slot() {
        let (mut session, a, b) = started();
        let before = session.clone();
        assert!(!session.release(Player::PlayerA, b));
        assert!(!session.release(Player::PlayerB, ConnectionId::new()));
        assert_eq!(session, before);

        assert!(session.release(Player::PlayerA, a));
        assert_eq!(session.slot(Player::PlayerB), SlotBinding::Connected(b));
    }

    #[test]
    fn idle_clock_tracks_live_connections() {
        let mut session = GameSession::new(Uuid::new_v4(), "123456".into(), Player::PlayerA);
        assert!(session.idle_for().is_some());

        let a = ConnectionId::new();
        session.join(Player::PlayerA, a, ReconnectPolicy::Allow).unwrap();
        assert!(session.idle_for().is_none());

        let b = ConnectionId::new();
        session.join(Player::PlayerB, b, ReconnectPolicy::Allow).unwrap();
        session.release(Player::PlayerA, a);
        assert!(session.idle_for().is_none());

        session.release(Player::PlayerB, b);
        assert!(session.idle_for().is_some());
    }
}
