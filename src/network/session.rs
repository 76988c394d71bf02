//! Save Session Management
//!
//! One [`GameSession`] per save: its state tree, watches, acknowledgement
//! progress, input queue and the outbound channel of every joined player.
//! [`SessionManager`] keys sessions by save id and runs their ticks.
//!
//! A tick is the only place the committed tree changes:
//!
//! 1. drain the input captured at tick start
//! 2. route `pendingAcks` to the ack engine
//! 3. dispatch the remaining input to the action bindings of the current mode
//! 4. fold in resolved deferred intents, then commit once
//! 5. advance the change tracker; watcher reactions land in the next commit
//! 6. queue the committed deltas on every player's outbound channel

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::network::pipeline::{
    ActionBindings, InputContext, InputQueue, OutboundChannel, PushMode, QueuedInput, SequenceCounter,
    DEFAULT_INPUT_CAPACITY,
};
use crate::network::protocol::{ClientPacket, PendingAck, ServerPacket};
use crate::state::ack::{AckEngine, AckRegistry};
use crate::state::mutation::{Mutation, MutationEngine};
use crate::state::observer::ChangeTracker;

/// Save/session identifier.
pub type SessionId = String;

/// Player identifier.
pub type PlayerId = String;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ticking.
    Running,
    /// Input is queued but no ticks run.
    Paused,
    /// Session closed; no more joins.
    Closed,
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Mode the session starts in.
    pub initial_mode: String,
    /// Bound of the input queue.
    pub input_capacity: usize,
    /// Maximum joined players.
    pub max_players: usize,
    /// Framing of outbound pushes.
    pub push_mode: PushMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_mode: "default".to_string(),
            input_capacity: DEFAULT_INPUT_CAPACITY,
            max_players: 16,
            push_mode: PushMode::Delta,
        }
    }
}

/// A player joined to a session.
#[derive(Debug)]
pub struct SessionPlayer {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Transport connection, if any.
    pub connection_id: Option<String>,
    /// When the player joined.
    pub joined_at: DateTime<Utc>,
    outbound: OutboundChannel,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Session that ticked.
    pub session_id: SessionId,
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Input packets drained.
    pub inputs: usize,
    /// Acks routed.
    pub acks: usize,
    /// Deferred intents folded in.
    pub deferred: usize,
    /// Whether anything was committed.
    pub committed: bool,
    /// Deltas queued for players.
    pub changes: usize,
    /// Watcher reactions queued for the next tick.
    pub reactions: usize,
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session is full.
    #[error("Session is full")]
    SessionFull,

    /// Session is closed.
    #[error("Session is closed")]
    SessionClosed,

    /// Player already joined to another session.
    #[error("Already in session {0}")]
    AlreadyInSession(String),

    /// Player not joined.
    #[error("Player not found: {0}")]
    PlayerNotFound(String),

    /// Input queue is full.
    #[error("Input queue full")]
    InputQueueFull,
}

/// Runs once on every newly created session, before it is shared.
pub type SessionInit = Arc<dyn Fn(&mut GameSession) + Send + Sync>;

/// Game logic shared by all sessions.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// Input handlers.
    pub bindings: Arc<ActionBindings>,
    /// Acknowledgement definitions.
    pub acks: Arc<AckRegistry>,
    /// Seeds state and registers watches on new sessions.
    pub init: Option<SessionInit>,
}

// =============================================================================
// SESSION
// =============================================================================

/// One save's live state.
pub struct GameSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Session configuration.
    pub config: SessionConfig,
    engine: MutationEngine,
    tracker: ChangeTracker,
    acks: AckEngine,
    inputs: InputQueue,
    bindings: Arc<ActionBindings>,
    players: BTreeMap<PlayerId, SessionPlayer>,
    mode: String,
    tick: u64,
    created_at: DateTime<Utc>,
    last_activity: i64,
}

impl GameSession {
    /// Create an empty session.
    pub fn new(
        id: impl Into<SessionId>,
        config: SessionConfig,
        bindings: Arc<ActionBindings>,
        acks: Arc<AckRegistry>,
    ) -> Self {
        let id = id.into();
        let created_at = Utc::now();
        Self {
            acks: AckEngine::new(id.clone(), acks),
            inputs: InputQueue::new(config.input_capacity),
            mode: config.initial_mode.clone(),
            id,
            state: SessionState::Running,
            config,
            engine: MutationEngine::new(),
            tracker: ChangeTracker::new(),
            bindings,
            players: BTreeMap::new(),
            tick: 0,
            created_at,
            last_activity: created_at.timestamp_millis(),
        }
    }

    /// Merge `initial` into the tree and commit it immediately.
    pub fn seed(&mut self, initial: Value) {
        self.engine.mutate(Mutation::merge(initial));
        self.engine.apply_pending_merges();
        let changes = self.engine.flush_changes();
        for player in self.players.values_mut() {
            player.outbound.queue_changes(changes.iter().cloned());
        }
    }

    /// Replace the whole tree and resync every player.
    pub fn restore(&mut self, state: Value) {
        self.engine.replace_state(state);
        for player in self.players.values_mut() {
            player.outbound.request_resync();
        }
        info!(session = %self.id, "state restored");
    }

    /// Join a player, replacing an earlier connection of the same player.
    /// Returns the committed tree to send as the initial snapshot.
    pub fn add_player(
        &mut self,
        player_id: &str,
        connection_id: Option<String>,
        now: i64,
    ) -> Result<Arc<Value>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        if !self.players.contains_key(player_id) && self.players.len() >= self.config.max_players {
            return Err(SessionError::SessionFull);
        }

        self.players.insert(
            player_id.to_string(),
            SessionPlayer {
                player_id: player_id.to_string(),
                connection_id,
                joined_at: Utc::now(),
                outbound: OutboundChannel::new(self.config.push_mode),
            },
        );
        self.last_activity = now;
        info!(session = %self.id, player = player_id, players = self.players.len(), "player joined");
        Ok(self.engine.snapshot())
    }

    /// Remove a player. With `connection_id`, only that connection's entry
    /// is removed, so a stale disconnect cannot evict a rejoined player.
    pub fn remove_player(&mut self, player_id: &str, connection_id: Option<&str>, now: i64) -> bool {
        let matches = self.players.get(player_id).is_some_and(|p| {
            connection_id.map_or(true, |c| p.connection_id.as_deref() == Some(c))
        });
        if !matches {
            return false;
        }
        self.players.remove(player_id);
        self.last_activity = now;
        info!(session = %self.id, player = player_id, players = self.players.len(), "player left");
        true
    }

    /// Queue a client packet for the next tick.
    pub fn enqueue_input(&mut self, player_id: &str, mut packet: ClientPacket, now: i64) -> Result<(), SessionError> {
        if !self.players.contains_key(player_id) {
            return Err(SessionError::PlayerNotFound(player_id.to_string()));
        }
        if let Some(receipt) = packet.received.take() {
            self.record_receipt(player_id, receipt.id, receipt.timestamp);
        }

        let queued = QueuedInput {
            packet,
            received_at: now,
            session_id: self.id.clone(),
            player_id: player_id.to_string(),
            mode: self.mode.clone(),
        };
        self.last_activity = now;
        if self.inputs.push(queued) {
            Ok(())
        } else {
            Err(SessionError::InputQueueFull)
        }
    }

    /// Queue acknowledgements for the next tick.
    pub fn enqueue_acks(&mut self, player_id: &str, acks: Vec<PendingAck>, now: i64) -> Result<(), SessionError> {
        self.enqueue_input(player_id, ClientPacket::acks_only(acks), now)
    }

    /// Stop ticking. Input keeps queueing.
    pub fn pause(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Paused;
            info!(session = %self.id, tick = self.tick, "session paused");
        }
    }

    /// Resume ticking.
    pub fn unpause(&mut self) {
        if self.state == SessionState::Paused {
            self.state = SessionState::Running;
            info!(session = %self.id, tick = self.tick, "session resumed");
        }
    }

    /// Close the session and drop every player.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.players.clear();
    }

    /// Run one tick. Returns `None` unless the session is running.
    pub fn run_tick(&mut self, now: i64) -> Option<TickReport> {
        if self.state != SessionState::Running {
            return None;
        }
        self.tick += 1;

        let batch = self.inputs.drain_tick();
        let connected: BTreeSet<PlayerId> = self.players.keys().cloned().collect();
        let mut report = TickReport {
            session_id: self.id.clone(),
            tick: self.tick,
            inputs: batch.len(),
            ..Default::default()
        };

        for mut entry in batch {
            for ack in std::mem::take(&mut entry.packet.pending_acks) {
                report.acks += 1;
                let payload = Value::Object(ack.extra);
                for mutation in self.acks.handle_ack(&entry.player_id, &ack.name, &payload, &connected) {
                    self.engine.mutate(mutation);
                }
            }

            if !entry.packet.input.is_empty() {
                let ctx = InputContext {
                    session_id: &self.id,
                    player_id: &entry.player_id,
                    mode: &entry.mode,
                    packet_id: entry.packet.id,
                    received_at: entry.received_at,
                    input: &entry.packet.input,
                    state: self.engine.all(),
                };
                let mutations = self.bindings.dispatch(&ctx);
                for mutation in mutations {
                    self.engine.mutate(mutation);
                }
            }

            if let (Some(id), Some(player)) = (entry.packet.id, self.players.get_mut(&entry.player_id)) {
                player.outbound.note_processed(id);
            }
        }

        report.deferred = self.engine.resolve_deferred();
        report.committed = self.engine.apply_pending_merges();

        self.tracker.update_state(self.engine.snapshot());
        let changes = self.engine.flush_changes();
        let reactions = self.tracker.detect_changes_and_notify_observers();
        report.changes = changes.len();
        report.reactions = reactions.len();
        for mutation in reactions {
            self.engine.mutate(mutation);
        }

        if !changes.is_empty() {
            for player in self.players.values_mut() {
                player.outbound.queue_changes(changes.iter().cloned());
            }
        }

        if report.committed {
            debug!(
                session = %self.id,
                tick = self.tick,
                at = now,
                inputs = report.inputs,
                changes = report.changes,
                "tick committed"
            );
        }
        Some(report)
    }

    /// Committed tree, for the join snapshot.
    pub fn initial_snapshot(&self) -> Arc<Value> {
        self.engine.snapshot()
    }

    /// Next outbound packet for a player, if anything changed.
    pub fn prepare_push(&mut self, player_id: &str, sequence: &SequenceCounter, now: i64) -> Option<ServerPacket> {
        let state = self.engine.all();
        let player = self.players.get_mut(player_id)?;
        player.outbound.prepare_push(state, sequence, now)
    }

    /// Match a client receipt to a sent packet. Returns the round trip.
    pub fn record_receipt(&mut self, player_id: &str, packet_id: u64, received_at: i64) -> Option<u64> {
        let player = self.players.get_mut(player_id)?;
        let rtt = player.outbound.record_receipt(packet_id, received_at)?;
        debug!(session = %self.id, player = player_id, packet_id, rtt, "receipt matched");
        Some(rtt)
    }

    /// Smoothed latency of a player, in milliseconds.
    pub fn latency_ms(&self, player_id: &str) -> Option<f64> {
        self.players.get(player_id)?.outbound.latency_ms()
    }

    /// Mutation engine, for seeding and reads.
    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    /// Mutable mutation engine.
    pub fn engine_mut(&mut self) -> &mut MutationEngine {
        &mut self.engine
    }

    /// Change tracker, for registering watches.
    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    /// Acknowledgement progress.
    pub fn acks(&self) -> &AckEngine {
        &self.acks
    }

    /// Current mode.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Switch mode. Applies to input queued from now on.
    pub fn set_mode(&mut self, mode: impl Into<String>) {
        let mode = mode.into();
        if mode != self.mode {
            debug!(session = %self.id, from = %self.mode, to = %mode, "mode changed");
            self.mode = mode;
        }
    }

    /// Is the player joined?
    pub fn has_player(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    /// Is `connection_id` the player's current connection?
    pub fn is_connected(&self, player_id: &str, connection_id: &str) -> bool {
        self.players
            .get(player_id)
            .is_some_and(|p| p.connection_id.as_deref() == Some(connection_id))
    }

    /// Joined player ids.
    pub fn player_ids(&self) -> impl Iterator<Item = &PlayerId> {
        self.players.keys()
    }

    /// Number of joined players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Packets waiting in the input queue.
    pub fn queued_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Ticks run so far.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// No players and no activity for longer than `timeout_ms`.
    pub fn is_idle(&self, now: i64, timeout_ms: i64) -> bool {
        self.players.is_empty() && now.saturating_sub(self.last_activity) > timeout_ms
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Owns every live session, keyed by save id.
pub struct SessionManager {
    /// Active sessions.
    sessions: RwLock<BTreeMap<SessionId, Arc<RwLock<GameSession>>>>,
    /// Player to session mapping.
    player_sessions: RwLock<BTreeMap<PlayerId, SessionId>>,
    config: SessionConfig,
    hooks: SessionHooks,
}

impl SessionManager {
    /// Create a manager.
    pub fn new(config: SessionConfig, hooks: SessionHooks) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            player_sessions: RwLock::new(BTreeMap::new()),
            config,
            hooks,
        }
    }

    /// Get a session, creating and initializing it if needed.
    pub async fn get_or_create(&self, id: &str) -> Arc<RwLock<GameSession>> {
        if let Some(session) = self.get_session(id).await {
            return session;
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                let mut session = GameSession::new(
                    id,
                    self.config.clone(),
                    self.hooks.bindings.clone(),
                    self.hooks.acks.clone(),
                );
                if let Some(init) = &self.hooks.init {
                    init(&mut session);
                }
                info!(session = id, "session created");
                Arc::new(RwLock::new(session))
            })
            .clone()
    }

    /// Get a session by id.
    pub async fn get_session(&self, id: &str) -> Option<Arc<RwLock<GameSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Get the session a player is joined to.
    pub async fn get_player_session(&self, player_id: &str) -> Option<Arc<RwLock<GameSession>>> {
        let session_id = self.player_sessions.read().await.get(player_id).cloned()?;
        self.get_session(&session_id).await
    }

    /// Join a player to a session. Returns the initial snapshot.
    pub async fn join(
        &self,
        session_id: &str,
        player_id: &str,
        connection_id: Option<String>,
        now: i64,
    ) -> Result<Arc<Value>, SessionError> {
        if let Some(current) = self.player_sessions.read().await.get(player_id) {
            if current != session_id {
                return Err(SessionError::AlreadyInSession(current.clone()));
            }
        }

        let session = self.get_or_create(session_id).await;
        let snapshot = session.write().await.add_player(player_id, connection_id, now)?;
        self.player_sessions
            .write()
            .await
            .insert(player_id.to_string(), session_id.to_string());
        Ok(snapshot)
    }

    /// Remove a player from its session. See [`GameSession::remove_player`].
    pub async fn leave(&self, player_id: &str, connection_id: Option<&str>, now: i64) -> Option<SessionId> {
        let session_id = self.player_sessions.read().await.get(player_id).cloned()?;
        let removed = match self.get_session(&session_id).await {
            Some(session) => session.write().await.remove_player(player_id, connection_id, now),
            None => true,
        };
        if !removed {
            return None;
        }
        self.player_sessions.write().await.remove(player_id);
        Some(session_id)
    }

    /// Close and drop a session.
    pub async fn remove_session(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(id) else {
            return false;
        };
        session.write().await.close();
        self.player_sessions.write().await.retain(|_, s| s != id);
        info!(session = id, "session removed");
        true
    }

    /// Committed tree of a session, for persistence.
    pub async fn snapshot(&self, id: &str) -> Option<Arc<Value>> {
        let session = self.get_session(id).await?;
        let snapshot = session.read().await.initial_snapshot();
        Some(snapshot)
    }

    /// Replace a session's tree from persistence, creating the session if needed.
    pub async fn restore(&self, id: &str, state: Value) {
        let session = self.get_or_create(id).await;
        session.write().await.restore(state);
    }

    /// Tick every session once, one after the other.
    pub async fn tick_all(&self, now: i64) -> Vec<TickReport> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut reports = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Some(report) = session.write().await.run_tick(now) {
                reports.push(report);
            }
        }
        reports
    }

    /// Drop closed sessions and sessions idle longer than `idle_timeout_ms`.
    pub async fn cleanup(&self, now: i64, idle_timeout_ms: i64) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();

        for (id, session) in sessions.iter() {
            let s = session.read().await;
            if s.state == SessionState::Closed || s.is_idle(now, idle_timeout_ms) {
                to_remove.push(id.clone());
            }
        }

        for id in &to_remove {
            if let Some(session) = sessions.remove(id) {
                session.write().await.close();
            }
            warn!(session = %id, "dropping idle session");
        }
        to_remove.len()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default(), SessionHooks::default())
    }
}
