//! Session registry - join-code and id index of live sessions

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{GameStore, StoredGame};
use crate::ws::protocol::ServerMsg;

use super::board::{Coord, Player};
use super::error::GameError;
use super::session::{ConnectionId, GameSession, Phase, ReconnectPolicy, SessionSnapshot};

/// Attempts at drawing an unused join code before giving up
const MAX_CODE_ATTEMPTS: usize = 32;

/// How often idle sessions are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered updates per game before slow subscribers start lagging
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Handle to one live session. Cloning shares the same session.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub join_code: String,
    session: Arc<Mutex<GameSession>>,
    updates_tx: broadcast::Sender<ServerMsg>,
}

impl SessionHandle {
    fn new(session: GameSession) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            id: session.id(),
            join_code: session.join_code().to_string(),
            session: Arc::new(Mutex::new(session)),
            updates_tx,
        }
    }

    /// Subscribe to this game's update group
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.updates_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    /// Durable record of the current state
    pub fn record(&self) -> StoredGame {
        StoredGame::from(&*self.session.lock())
    }

    pub fn live_connections(&self) -> usize {
        self.session.lock().live_connections()
    }

    pub fn is_abandoned(&self) -> bool {
        self.session.lock().phase() == Phase::Abandoned
    }

    pub fn join(
        &self,
        player: Player,
        connection: ConnectionId,
        policy: ReconnectPolicy,
    ) -> Result<SessionSnapshot, GameError> {
        self.mutate(|session| session.join(player, connection, policy))
    }

    pub fn reserve(&self, player: Player) -> Result<SessionSnapshot, GameError> {
        self.mutate(|session| session.reserve(player))
    }

    pub fn apply_move(
        &self,
        mover: Player,
        from: Coord,
        to: Coord,
    ) -> Result<SessionSnapshot, GameError> {
        self.mutate(|session| session.apply_move(mover, from, to))
    }

    /// Vacate `player`'s slot if `connection` holds it. Returns whether it was
    /// released and whether any live connection remains.
    pub fn release(&self, player: Player, connection: ConnectionId) -> (bool, bool) {
        let mut session = self.session.lock();
        let released = session.release(player, connection);
        if released {
            self.publish(session.snapshot());
        }
        (released, session.has_live_connection())
    }

    /// Run a state transition and publish the resulting snapshot while still
    /// holding the session lock, so updates go out in the order they were applied.
    fn mutate<F>(&self, op: F) -> Result<SessionSnapshot, GameError>
    where
        F: FnOnce(&mut GameSession) -> Result<SessionSnapshot, GameError>,
    {
        let mut session = self.session.lock();
        let snapshot = op(&mut *session)?;
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn publish(&self, snapshot: SessionSnapshot) {
        // No receivers is fine: nobody is subscribed yet
        let _ = self.updates_tx.send(ServerMsg::GameUpdate(snapshot));
    }
}

/// Registry of all live sessions
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
    codes: DashMap<String, Uuid>,
    rng: Mutex<ChaCha8Rng>,
    code_length: usize,
    policy: ReconnectPolicy,
    store: GameStore,
}

impl SessionRegistry {
    pub fn new(code_length: usize, policy: ReconnectPolicy, store: GameStore) -> Self {
        Self::with_rng(ChaCha8Rng::from_entropy(), code_length, policy, store)
    }

    pub fn with_rng(
        rng: ChaCha8Rng,
        code_length: usize,
        policy: ReconnectPolicy,
        store: GameStore,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            codes: DashMap::new(),
            rng: Mutex::new(rng),
            code_length,
            policy,
            store,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Create a session with the initiating player's slot reserved
    pub fn create(&self, initiator: Player) -> Result<SessionHandle, GameError> {
        let id = Uuid::new_v4();
        let code = self.claim_code(id)?;
        let handle = SessionHandle::new(GameSession::new(id, code, initiator));
        self.sessions.insert(id, handle.clone());

        info!(
            game_id = %id,
            join_code = %handle.join_code,
            player = %initiator,
            "Created game"
        );
        Ok(handle)
    }

    /// Draw codes until one is atomically claimed for `id`
    fn claim_code(&self, id: Uuid) -> Result<String, GameError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&mut self.rng.lock(), self.code_length);
            match self.codes.entry(code) {
                Entry::Vacant(slot) => {
                    let code = slot.key().clone();
                    slot.insert(id);
                    return Ok(code);
                }
                Entry::Occupied(taken) => {
                    debug!(join_code = %taken.key(), "Join code collision, retrying");
                }
            }
        }
        Err(GameError::Internal("join code space exhausted".to_string()))
    }

    /// Live session by id. Abandoned sessions still being retired are not found.
    pub fn find_by_id(&self, id: &Uuid) -> Result<SessionHandle, GameError> {
        self.sessions
            .get(id)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_abandoned())
            .ok_or(GameError::NotFound)
    }

    pub fn find_by_code(&self, code: &str) -> Result<SessionHandle, GameError> {
        let id = self.codes.get(code).map(|id| *id).ok_or(GameError::NotFound)?;
        self.find_by_id(&id)
    }

    /// Look up by id, falling back to the store
    pub async fn resolve_by_id(&self, id: Uuid) -> Result<SessionHandle, GameError> {
        if let Ok(handle) = self.find_by_id(&id) {
            return Ok(handle);
        }
        let stored = self.store.load_by_id(id).await.map_err(|e| {
            error!(game_id = %id, error = %e, "Failed to load game");
            GameError::Internal(e.to_string())
        })?;
        self.adopt_stored(stored)
    }

    /// Look up by join code, falling back to the store
    pub async fn resolve_by_code(&self, code: &str) -> Result<SessionHandle, GameError> {
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(GameError::NotFound);
        }
        if let Ok(handle) = self.find_by_code(code) {
            return Ok(handle);
        }
        let stored = self.store.load_by_code(code).await.map_err(|e| {
            error!(join_code = %code, error = %e, "Failed to load game");
            GameError::Internal(e.to_string())
        })?;
        self.adopt_stored(stored)
    }

    fn adopt_stored(&self, stored: Option<StoredGame>) -> Result<SessionHandle, GameError> {
        match stored {
            Some(stored) if stored.phase != Phase::Abandoned => {
                self.adopt(GameSession::from(stored))
            }
            _ => Err(GameError::NotFound),
        }
    }

    /// Register a session loaded from storage. Connections from a previous
    /// process are gone, so live bindings become vacated.
    pub fn adopt(&self, mut session: GameSession) -> Result<SessionHandle, GameError> {
        session.detach_connections();
        let id = session.id();

        match self.codes.entry(session.join_code().to_string()) {
            Entry::Occupied(owner) if *owner.get() != id => {
                warn!(game_id = %id, join_code = %owner.key(), "Stored game code already in use");
                return Err(GameError::Internal("join code conflict".to_string()));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        // Another task may have adopted the same game first
        let handle = self
            .sessions
            .entry(id)
            .or_insert_with(|| SessionHandle::new(session))
            .value()
            .clone();

        // A stale record must not revive a session that is being retired
        if handle.is_abandoned() {
            return Err(GameError::NotFound);
        }

        info!(game_id = %id, "Restored game from store");
        Ok(handle)
    }

    /// Abandon the session if it has had no live connection for at least
    /// `idle_limit`. The abandoned record is stored before the session leaves
    /// the registry. Returns true when the session was abandoned.
    pub async fn abandon_if_idle(&self, id: &Uuid, idle_limit: Duration) -> bool {
        let Ok(handle) = self.find_by_id(id) else {
            return false;
        };

        let record = {
            let mut session = handle.session.lock();
            match session.idle_for() {
                Some(idle) if idle >= idle_limit => {}
                _ => return false,
            }
            session.mark_abandoned();
            handle.publish(session.snapshot());
            StoredGame::from(&*session)
        };

        if let Err(e) = self.store.save(&record).await {
            error!(game_id = %id, error = %e, "Failed to save abandoned game");
        }

        self.remove(id);
        info!(game_id = %id, "Game abandoned");
        true
    }

    /// Abandon every session idle for at least `idle_limit`. Returns how many.
    pub async fn sweep_idle(&self, idle_limit: Duration) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();

        let mut swept = 0;
        for id in ids {
            if self.abandon_if_idle(&id, idle_limit).await {
                swept += 1;
            }
        }
        swept
    }

    /// Periodically sweep idle sessions. Runs until the task is dropped.
    pub async fn run_sweeper(&self, idle_limit: Duration, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let swept = self.sweep_idle(idle_limit).await;
            if swept > 0 {
                info!(swept, remaining = self.active_games(), "Swept idle games");
            }
        }
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(id)?;
        self.codes.remove_if(&handle.join_code, |_, owner| owner == id);
        Some(handle)
    }

    /// Persist the session's current state. Failures are logged, never surfaced.
    pub async fn persist(&self, handle: &SessionHandle) {
        let record = handle.record();
        if let Err(e) = self.store.save(&record).await {
            error!(game_id = %handle.id, error = %e, "Failed to save game");
        }
    }

    pub fn active_games(&self) -> usize {
        self.sessions.len()
    }

    pub fn live_connections(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().live_connections())
            .sum()
    }
}

/// Random decimal join code of `length` digits without a leading zero
pub(crate) fn generate_code(rng: &mut ChaCha8Rng, length: usize) -> String {
    let mut code = String::with_capacity(length);
    code.push(char::from(b'0' + rng.gen_range(1..=9u8)));
    for _ in 1..length {
        code.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::SlotStatus;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(6, ReconnectPolicy::Allow, GameStore::memory())
    }

    #[test]
    fn create_then_find_by_code_and_id() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();

        assert_eq!(handle.join_code.len(), 6);
        assert!(handle.join_code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(registry.find_by_code(&handle.join_code).unwrap().id, handle.id);
        assert_eq!(registry.find_by_id(&handle.id).unwrap().join_code, handle.join_code);
        assert_eq!(registry.active_games(), 1);
    }

    #[test]
    fn unknown_lookups_are_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.find_by_code("123456"),
            Err(GameError::NotFound)
        ));
        assert!(matches!(
            registry.find_by_id(&Uuid::new_v4()),
            Err(GameError::NotFound)
        ));
    }

    #[test]
    fn colliding_code_is_redrawn() {
        let seed = 7;
        let first_draw = generate_code(&mut ChaCha8Rng::seed_from_u64(seed), 6);

        let registry = SessionRegistry::with_rng(
            ChaCha8Rng::seed_from_u64(seed),
            6,
            ReconnectPolicy::Allow,
            GameStore::memory(),
        );
        let squatter = Uuid::new_v4();
        registry.codes.insert(first_draw.clone(), squatter);

        let handle = registry.create(Player::PlayerA).unwrap();
        assert_ne!(handle.join_code, first_draw);
        assert_eq!(*registry.codes.get(&first_draw).unwrap(), squatter);
    }

    #[test]
    fn codes_stay_unique_across_many_games() {
        // A tiny code space forces frequent collisions
        let registry = SessionRegistry::new(2, ReconnectPolicy::Allow, GameStore::memory());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..40 {
            let handle = registry.create(Player::PlayerA).unwrap();
            assert!(seen.insert(handle.join_code.clone()));
        }
    }

    #[test]
    fn remove_frees_the_code() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();
        assert!(registry.remove(&handle.id).is_some());
        assert!(registry.find_by_code(&handle.join_code).is_err());
        assert_eq!(registry.active_games(), 0);
    }

    #[tokio::test]
    async fn updates_are_broadcast_to_subscribers() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();
        let mut rx = handle.subscribe();

        handle.reserve(Player::PlayerB).unwrap();

        match rx.recv().await.unwrap() {
            ServerMsg::GameUpdate(snapshot) => {
                assert_eq!(snapshot.phase, Phase::InProgress);
                assert_eq!(snapshot.players.player_b, SlotStatus::Reserved);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn failed_operations_publish_nothing() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();
        let mut rx = handle.subscribe();

        assert!(handle.reserve(Player::PlayerA).is_err());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn abandon_only_when_idle() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();
        let conn = ConnectionId::new();
        handle.join(Player::PlayerA, conn, registry.policy()).unwrap();

        assert!(!registry.abandon_if_idle(&handle.id, Duration::ZERO).await);
        assert_eq!(registry.active_games(), 1);

        let (released, still_live) = handle.release(Player::PlayerA, conn);
        assert!(released);
        assert!(!still_live);

        assert!(registry.abandon_if_idle(&handle.id, Duration::ZERO).await);
        assert_eq!(handle.snapshot().phase, Phase::Abandoned);
        assert!(registry.find_by_id(&handle.id).is_err());
    }

    #[tokio::test]
    async fn abandoned_record_is_stored_before_removal() {
        let store = GameStore::memory();
        let registry = SessionRegistry::new(6, ReconnectPolicy::Allow, store.clone());
        let handle = registry.create(Player::PlayerA).unwrap();
        handle.reserve(Player::PlayerB).unwrap();
        registry.persist(&handle).await;

        assert!(registry.abandon_if_idle(&handle.id, Duration::ZERO).await);

        // The store no longer offers a record that could revive the game
        assert!(store.load_by_id(handle.id).await.unwrap().is_none());
        assert!(matches!(
            registry.resolve_by_code(&handle.join_code).await,
            Err(GameError::NotFound)
        ));
        assert_eq!(registry.active_games(), 0);
    }

    #[tokio::test]
    async fn retiring_session_is_not_revived_from_a_stale_record() {
        let store = GameStore::memory();
        let registry = SessionRegistry::new(6, ReconnectPolicy::Allow, store.clone());
        let handle = registry.create(Player::PlayerA).unwrap();
        handle.reserve(Player::PlayerB).unwrap();
        registry.persist(&handle).await;

        // Abandoned in memory while the store still holds the in-progress record
        handle.session.lock().mark_abandoned();

        assert!(matches!(
            registry.resolve_by_id(handle.id).await,
            Err(GameError::NotFound)
        ));
        assert!(matches!(
            registry.resolve_by_code(&handle.join_code).await,
            Err(GameError::NotFound)
        ));
        assert_eq!(handle.snapshot().phase, Phase::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_retires_sessions_nobody_connected_to() {
        let registry = registry();
        let forgotten = registry.create(Player::PlayerA).unwrap();
        let played = registry.create(Player::PlayerA).unwrap();
        played
            .join(Player::PlayerA, ConnectionId::new(), registry.policy())
            .unwrap();

        let idle_limit = Duration::from_secs(600);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.sweep_idle(idle_limit).await, 0);

        tokio::time::sleep(idle_limit).await;
        assert_eq!(registry.sweep_idle(idle_limit).await, 1);

        assert!(registry.find_by_code(&forgotten.join_code).is_err());
        assert_eq!(registry.find_by_id(&played.id).unwrap().id, played.id);
        assert_eq!(registry.active_games(), 1);
    }

    #[tokio::test]
    async fn malformed_codes_are_not_found() {
        let registry = registry();
        for code in ["", "12a456", "1&phase=eq.in_progress"] {
            assert!(matches!(
                registry.resolve_by_code(code).await,
                Err(GameError::NotFound)
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_moves_from_one_position_apply_once() {
        let registry = registry();
        let handle = registry.create(Player::PlayerA).unwrap();
        handle.reserve(Player::PlayerB).unwrap();
        let version = handle.snapshot().version;

        let contenders = 16;
        let barrier = Arc::new(tokio::sync::Barrier::new(contenders));
        let tasks: Vec<_> = (0..contenders)
            .map(|_| {
                let handle = handle.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    handle.apply_move(Player::PlayerA, Coord::new(0, 0), Coord::new(1, 1))
                })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => applied += 1,
                Err(e) => assert!(matches!(
                    e,
                    GameError::NotYourTurn | GameError::IllegalMove
                )),
            }
        }

        let snapshot = handle.snapshot();
        assert_eq!(applied, 1);
        assert_eq!(snapshot.version, version + 1);
        assert_eq!(snapshot.current_player, Some(Player::PlayerB));
        assert!(snapshot.board.get(Coord::new(0, 0)).is_none());
    }

    #[test]
    fn adopt_downgrades_live_connections() {
        let registry = registry();
        let mut session = GameSession::new(Uuid::new_v4(), "555555".into(), Player::PlayerA);
        session
            .join(Player::PlayerA, ConnectionId::new(), ReconnectPolicy::Allow)
            .unwrap();

        let handle = registry.adopt(session).unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.players.player_a, SlotStatus::Vacated);
        assert_eq!(registry.find_by_code("555555").unwrap().id, handle.id);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_store() {
        let store = GameStore::memory();
        let writer = SessionRegistry::new(6, ReconnectPolicy::Allow, store.clone());
        let handle = writer.create(Player::PlayerA).unwrap();
        handle.reserve(Player::PlayerB).unwrap();
        writer.persist(&handle).await;

        // A fresh registry sharing the store, as after a restart
        let reader = SessionRegistry::new(6, ReconnectPolicy::Allow, store);
        let restored = reader.resolve_by_code(&handle.join_code).await.unwrap();
        assert_eq!(restored.id, handle.id);
        assert_eq!(restored.snapshot(), handle.snapshot());

        let by_id = reader.resolve_by_id(handle.id).await.unwrap();
        assert_eq!(by_id.id, handle.id);
        assert!(matches!(
            reader.resolve_by_id(Uuid::new_v4()).await,
            Err(GameError::NotFound)
        ));
    }

    #[tokio::test]
    async fn abandoned_games_are_not_restored() {
        let store = GameStore::memory();
        let writer = SessionRegistry::new(6, ReconnectPolicy::Allow, store.clone());
        let handle = writer.create(Player::PlayerA).unwrap();
        assert!(writer.abandon_if_idle(&handle.id, Duration::ZERO).await);

        let reader = SessionRegistry::new(6, ReconnectPolicy::Allow, store);
        assert!(matches!(
            reader.resolve_by_id(handle.id).await,
            Err(GameError::NotFound)
        ));
    }
}
