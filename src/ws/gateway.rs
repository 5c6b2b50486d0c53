//! Realtime gateway - routes connection events to sessions
//!
//! Transport-agnostic: the WebSocket handler owns the socket and forwards
//! parsed messages here. Mover identity comes only from the connection's
//! binding, never from the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::{
    ConnectionId, Coord, GameError, Piece, Player, SessionHandle, SessionRegistry,
    SessionSnapshot,
};

use super::protocol::ServerMsg;

/// A connection's claim on one player slot of one game
#[derive(Clone)]
pub struct Binding {
    pub handle: SessionHandle,
    pub player: Player,
}

/// Per-connection gateway state, dropped when the connection closes
pub struct Connection {
    pub id: ConnectionId,
    binding: Option<Binding>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            binding: None,
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    abandon_grace: Duration,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, abandon_grace: Duration) -> Self {
        Self {
            registry,
            abandon_grace,
        }
    }

    /// Bind the connection to `player` in `game_id`.
    ///
    /// Returns the game's update stream; it already holds the snapshot produced
    /// by this join. A binding to another slot or game is released only once
    /// the new join has succeeded.
    pub async fn join(
        &self,
        conn: &mut Connection,
        game_id: Uuid,
        player: Player,
    ) -> Result<broadcast::Receiver<ServerMsg>, GameError> {
        let handle = self.registry.resolve_by_id(game_id).await?;

        let updates = handle.subscribe();
        handle.join(player, conn.id, self.registry.policy())?;

        let previous = conn.binding.replace(Binding {
            handle: handle.clone(),
            player,
        });
        if let Some(previous) = previous {
            if previous.handle.id != game_id || previous.player != player {
                self.release(conn.id, previous).await;
            }
        }

        info!(
            game_id = %game_id,
            connection_id = %conn.id,
            player = %player,
            "Player joined game"
        );

        self.registry.persist(&handle).await;
        Ok(updates)
    }

    /// Validate and apply a move on behalf of the bound player
    pub async fn make_move(
        &self,
        conn: &Connection,
        game_id: Uuid,
        from: Coord,
        to: Coord,
        piece: Option<Piece>,
    ) -> Result<SessionSnapshot, GameError> {
        let binding = conn
            .binding
            .as_ref()
            .ok_or_else(|| GameError::Validation("join a game before moving".to_string()))?;

        if binding.handle.id != game_id {
            return Err(GameError::Validation(
                "connection is bound to a different game".to_string(),
            ));
        }

        if piece.is_some_and(|p| p.owner != binding.player) {
            return Err(GameError::IllegalMove);
        }

        let snapshot = binding.handle.apply_move(binding.player, from, to)?;

        debug!(
            game_id = %game_id,
            player = %binding.player,
            from = ?from,
            to = ?to,
            version = snapshot.version,
            "Move applied"
        );

        self.registry.persist(&binding.handle).await;
        Ok(snapshot)
    }

    /// Release the connection's slot. When nobody is left connected the game
    /// is abandoned after the grace period unless someone rejoins.
    pub async fn disconnect(&self, conn: &mut Connection) {
        if let Some(binding) = conn.binding.take() {
            self.release(conn.id, binding).await;
        }
    }

    async fn release(&self, connection: ConnectionId, binding: Binding) {
        let (released, still_live) = binding.handle.release(binding.player, connection);
        if released {
            info!(
                game_id = %binding.handle.id,
                connection_id = %connection,
                player = %binding.player,
                "Player left game"
            );
        }
        self.registry.persist(&binding.handle).await;

        if still_live {
            return;
        }

        let grace = self.abandon_grace;
        if grace.is_zero() {
            abandon(&self.registry, &binding.handle, grace).await;
        } else {
            let registry = self.registry.clone();
            let handle = binding.handle;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                abandon(&registry, &handle, grace).await;
            });
        }
    }
}

/// Idleness is measured from the latest disconnect, so an earlier timer
/// cannot cut a later grace period short
async fn abandon(registry: &SessionRegistry, handle: &SessionHandle, grace: Duration) {
    if !registry.abandon_if_idle(&handle.id, grace).await {
        debug!(game_id = %handle.id, "Game still in use, kept");
    }
}

/// Turn a gateway failure into the targeted error event for the requester
pub fn error_reply(conn: &Connection, err: &GameError) -> ServerMsg {
    match err {
        GameError::Internal(detail) => {
            warn!(connection_id = %conn.id, error = %detail, "Request failed");
        }
        other => {
            debug!(connection_id = %conn.id, code = other.code(), "Request rejected");
        }
    }
    ServerMsg::from(err)
}
