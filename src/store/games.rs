//! Game persistence: stored record and store backends

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::game::{Board, GameSession, Phase, Player, SlotBinding, Slots};

use super::rest::{RestClient, RestError};

const GAMES_TABLE: &str = "games";

/// Durable form of a session, one row per game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGame {
    pub id: Uuid,
    pub join_code: String,
    pub board: Board,
    pub players: Slots<SlotBinding>,
    pub current_player: Player,
    pub phase: Phase,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GameSession> for StoredGame {
    fn from(session: &GameSession) -> Self {
        Self {
            id: session.id,
            join_code: session.join_code.clone(),
            board: session.board.clone(),
            players: session.players,
            current_player: session.current_player,
            phase: session.phase,
            version: session.version,
            created_at: session.created_at,
            updated_at: Utc::now(),
        }
    }
}

impl From<StoredGame> for GameSession {
    fn from(stored: StoredGame) -> Self {
        Self {
            id: stored.id,
            join_code: stored.join_code,
            board: stored.board,
            players: stored.players,
            current_player: stored.current_player,
            phase: stored.phase,
            version: stored.version,
            created_at: stored.created_at,
            idle_since: None,
        }
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Rest(#[from] RestError),
}

/// In-process store; the default when no durable backend is configured.
/// Abandoned games are dropped, only their ids are remembered.
#[derive(Clone, Default)]
pub struct MemoryStore {
    games: Arc<DashMap<Uuid, StoredGame>>,
    codes: Arc<DashMap<String, Uuid>>,
    retired: Arc<DashSet<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a record unless a newer version is already stored. The entry lock
    /// is held throughout so a stale save cannot follow retirement.
    pub fn save(&self, game: &StoredGame) {
        let entry = self.games.entry(game.id);
        if self.retired.contains(&game.id) {
            return;
        }

        if game.phase == Phase::Abandoned {
            self.retired.insert(game.id);
            if let Entry::Occupied(existing) = entry {
                let (_, old) = existing.remove_entry();
                self.codes
                    .remove_if(&old.join_code, |_, owner| *owner == game.id);
            }
            return;
        }

        match entry {
            Entry::Occupied(mut existing) => {
                if existing.get().version > game.version {
                    return;
                }
                existing.insert(game.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(game.clone());
            }
        }
        self.codes.insert(game.join_code.clone(), game.id);
    }

    pub fn load_by_id(&self, id: Uuid) -> Option<StoredGame> {
        self.games.get(&id).map(|g| g.value().clone())
    }

    pub fn load_by_code(&self, code: &str) -> Option<StoredGame> {
        let id = *self.codes.get(code)?;
        self.load_by_id(id)
    }
}

/// PostgREST-backed store
#[derive(Clone)]
pub struct RestStore {
    client: RestClient,
}

impl RestStore {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }

    /// Create the row if missing, then overwrite it only from an older version.
    /// Out-of-order saves can never roll the row back.
    pub async fn save(&self, game: &StoredGame) -> Result<(), RestError> {
        self.client.insert_ignoring_duplicates(GAMES_TABLE, game, "id").await?;
        self.client
            .update(GAMES_TABLE, &stale_row_query(game), game)
            .await
    }

    pub async fn load_by_id(&self, id: Uuid) -> Result<Option<StoredGame>, RestError> {
        let query = format!("id=eq.{}", id);
        self.client.get_one(GAMES_TABLE, &query).await
    }

    pub async fn load_by_code(&self, code: &str) -> Result<Option<StoredGame>, RestError> {
        self.client.get_one(GAMES_TABLE, &live_code_query(code)).await
    }
}

/// Codes are reused once a game is abandoned, so only the newest live row counts
fn live_code_query(code: &str) -> String {
    format!(
        "join_code=eq.{}&phase=neq.abandoned&order=updated_at.desc&limit=1",
        code
    )
}

fn stale_row_query(game: &StoredGame) -> String {
    format!("id=eq.{}&version=lt.{}", game.id, game.version)
}

/// Persistence backend selected at startup
#[derive(Clone)]
pub enum GameStore {
    Memory(MemoryStore),
    Rest(RestStore),
}

impl GameStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn save(&self, game: &StoredGame) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.save(game);
                Ok(())
            }
            Self::Rest(store) => Ok(store.save(game).await?),
        }
    }

    pub async fn load_by_id(&self, id: Uuid) -> Result<Option<StoredGame>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.load_by_id(id)),
            Self::Rest(store) => Ok(store.load_by_id(id).await?),
        }
    }

    pub async fn load_by_code(&self, code: &str) -> Result<Option<StoredGame>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.load_by_code(code)),
            Self::Rest(store) => Ok(store.load_by_code(code).await?),
        }
    }
}
