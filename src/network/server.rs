//! WebSocket Sync Server
//!
//! Transport adapter around [`SessionManager`]. Socket I/O only enqueues
//! input or reads committed state; every write to a session's tree happens
//! in the simulation tick loop.
//!
//! Background tasks:
//! - one simulation loop ticking every session at `tick_rate`
//! - one push loop per joined connection at `push_rate`, aborted on leave
//! - one cleanup loop dropping idle connections and sessions

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::network::pipeline::{now_millis, PushMode, SequenceCounter};
use crate::network::protocol::{ClientMessage, ServerPacket, TransportEvent};
use crate::network::session::{
    GameSession, PlayerId, SessionConfig, SessionError, SessionHooks, SessionId, SessionManager, SessionState,
};

/// Outbound packets buffered per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Period of the cleanup loop.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections and empty sessions idle this long are dropped.
    pub idle_timeout: Duration,
    /// Simulation tick rate (Hz).
    pub tick_rate: u32,
    /// Outbound push rate per connection (Hz).
    pub push_rate: u32,
    /// Settings for new sessions.
    pub session: SessionConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            tick_rate: crate::TICK_RATE,
            push_rate: crate::PUSH_RATE,
            session: SessionConfig::default(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

fn env_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(ConfigError::InvalidValue { var, value: raw }),
    }
}

impl ServerConfig {
    /// Defaults overridden by `SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = env_var("SYNC_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(rate) = env_var::<u32>("SYNC_TICK_RATE")? {
            config.tick_rate = rate.max(1);
        }
        if let Some(rate) = env_var::<u32>("SYNC_PUSH_RATE")? {
            config.push_rate = rate.max(1);
        }
        if let Some(mode) = env_var::<PushMode>("SYNC_PUSH_MODE")? {
            config.session.push_mode = mode;
        }
        if let Some(max) = env_var("SYNC_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(secs) = env_var("SYNC_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Bad configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message needs a joined connection.
    #[error("Not joined to a save")]
    NotJoined,

    /// Connection went away.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Connected client state.
struct ConnectedClient {
    addr: SocketAddr,
    player_id: Option<PlayerId>,
    session_id: Option<SessionId>,
    last_activity: Instant,
    sender: mpsc::Sender<ServerPacket>,
    push_task: Option<JoinHandle<()>>,
}

/// Handles shared by the server's tasks.
#[derive(Clone)]
struct ServerContext {
    config: Arc<ServerConfig>,
    sessions: Arc<SessionManager>,
    clients: Arc<RwLock<BTreeMap<String, ConnectedClient>>>,
    sequence: Arc<SequenceCounter>,
}

/// The sync server.
pub struct GameServer {
    ctx: ServerContext,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server with its own session manager.
    pub fn new(config: ServerConfig, hooks: SessionHooks) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session.clone(), hooks));
        Self::with_sessions(config, sessions)
    }

    /// Create a server over an existing session manager.
    pub fn with_sessions(config: ServerConfig, sessions: Arc<SessionManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx: ServerContext {
                config: Arc::new(config),
                sessions,
                clients: Arc::new(RwLock::new(BTreeMap::new())),
                sequence: Arc::new(SequenceCounter::new()),
            },
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Save sync server listening on {}", listener.local_addr()?);

        let tick_handle = tokio::spawn(Self::run_tick_loop(self.ctx.clone()));
        let cleanup_handle = tokio::spawn(Self::run_cleanup_loop(self.ctx.clone()));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.ctx.clients.read().await.len();
                            if clients_count >= self.ctx.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        tick_handle.abort();
        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let connection_id = Uuid::new_v4().to_string();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (packet_tx, mut packet_rx) = mpsc::channel::<ServerPacket>(OUTBOUND_BUFFER);
            ctx.register_client(&connection_id, addr, packet_tx.clone()).await;

            let sender_task = tokio::spawn(async move {
                while let Some(packet) = packet_rx.recv().await {
                    let text = match packet.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize packet: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            ctx.handle_event(TransportEvent::Connect {
                connection_id: connection_id.clone(),
            })
            .await;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let event = match msg {
                            Some(Ok(Message::Text(text))) => {
                                decode_event(&connection_id, ClientMessage::from_json(&text))
                            }
                            Some(Ok(Message::Binary(data))) => {
                                decode_event(&connection_id, serde_json::from_slice(&data))
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                ctx.handle_event(TransportEvent::Error {
                                    connection_id: connection_id.clone(),
                                    error: e.to_string(),
                                })
                                .await;
                                break;
                            }
                        };
                        ctx.handle_event(event).await;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = packet_tx.send(ServerPacket::error("Server shutting down")).await;
                        break;
                    }
                }
            }

            ctx.handle_event(TransportEvent::Disconnect { connection_id }).await;
            sender_task.abort();
            info!("Client {} cleaned up", addr);
        });
    }

    /// Tick every session at the simulation rate.
    async fn run_tick_loop(ctx: ServerContext) {
        let tick_duration = Duration::from_secs_f64(1.0 / f64::from(ctx.config.tick_rate.max(1)));
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;
            let reports = ctx.sessions.tick_all(now_millis()).await;
            let committed = reports.iter().filter(|r| r.committed).count();
            if committed > 0 {
                debug!(sessions = reports.len(), committed, "simulation tick");
            }
        }
    }

    /// Drop idle connections and empty idle sessions.
    async fn run_cleanup_loop(ctx: ServerContext) {
        let mut cleanup_interval = interval(CLEANUP_INTERVAL);
        let idle_timeout = ctx.config.idle_timeout;

        loop {
            cleanup_interval.tick().await;

            let now = Instant::now();
            let idle: Vec<String> = {
                let clients = ctx.clients.read().await;
                clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for connection_id in idle {
                ctx.disconnect(&connection_id).await;
                info!("Removed idle client {}", connection_id);
            }

            let idle_ms = i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX);
            let removed = ctx.sessions.cleanup(now_millis(), idle_ms).await;
            if removed > 0 {
                info!("Removed {} idle sessions", removed);
            }
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Session manager, for persistence.
    pub fn sessions(&self) -> Arc<SessionManager> {
        self.ctx.sessions.clone()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Get connected client count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.ctx.sessions.session_count().await
    }
}

fn decode_event(connection_id: &str, parsed: Result<ClientMessage, serde_json::Error>) -> TransportEvent {
    match parsed {
        Ok(message) => TransportEvent::Message {
            connection_id: connection_id.to_string(),
            message,
        },
        Err(e) => TransportEvent::Error {
            connection_id: connection_id.to_string(),
            error: e.to_string(),
        },
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ServerContext {
    async fn register_client(&self, connection_id: &str, addr: SocketAddr, sender: mpsc::Sender<ServerPacket>) {
        let mut clients = self.clients.write().await;
        clients.insert(
            connection_id.to_string(),
            ConnectedClient {
                addr,
                player_id: None,
                session_id: None,
                last_activity: Instant::now(),
                sender,
                push_task: None,
            },
        );
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connect { connection_id } => {
                debug!(connection = %connection_id, "connected");
            }
            TransportEvent::Message { connection_id, message } => {
                self.touch(&connection_id).await;
                if let Err(e) = self.handle_message(&connection_id, message).await {
                    debug!(connection = %connection_id, error = %e, "message rejected");
                    self.send(&connection_id, ServerPacket::error(e.to_string())).await;
                }
            }
            TransportEvent::Disconnect { connection_id } => {
                self.disconnect(&connection_id).await;
            }
            TransportEvent::Error { connection_id, error } => {
                debug!(connection = %connection_id, %error, "transport error");
                self.send(&connection_id, ServerPacket::error("Invalid message format")).await;
            }
        }
    }

    async fn handle_message(&self, connection_id: &str, message: ClientMessage) -> Result<(), GameServerError> {
        let now = now_millis();
        match message {
            ClientMessage::Join { save_id, player_id } => self.join(connection_id, save_id, player_id, now).await,
            ClientMessage::Input(packet) => {
                self.with_session(connection_id, |s, player| s.enqueue_input(player, packet, now))
                    .await
            }
            ClientMessage::Ack { pending_acks } => {
                self.with_session(connection_id, |s, player| s.enqueue_acks(player, pending_acks, now))
                    .await
            }
            ClientMessage::Pause => {
                self.with_session(connection_id, |s, _| {
                    s.pause();
                    Ok(())
                })
                .await
            }
            ClientMessage::Unpause => {
                self.with_session(connection_id, |s, _| {
                    s.unpause();
                    Ok(())
                })
                .await
            }
        }
    }

    async fn join(
        &self,
        connection_id: &str,
        save_id: SessionId,
        player_id: PlayerId,
        now: i64,
    ) -> Result<(), GameServerError> {
        self.leave(connection_id, now).await;

        let snapshot = self
            .sessions
            .join(&save_id, &player_id, Some(connection_id.to_string()), now)
            .await?;
        let session = self
            .sessions
            .get_session(&save_id)
            .await
            .ok_or_else(|| SessionError::SessionNotFound(save_id.clone()))?;

        let sender = {
            let clients = self.clients.read().await;
            clients.get(connection_id).map(|c| c.sender.clone())
        }
        .ok_or(GameServerError::ConnectionClosed)?;
        sender
            .send(ServerPacket::Snapshot((*snapshot).clone()))
            .await
            .map_err(|_| GameServerError::ConnectionClosed)?;

        let push_task = self.spawn_push_loop(session, player_id.clone(), connection_id.to_string(), sender);
        let mut clients = self.clients.write().await;
        match clients.get_mut(connection_id) {
            Some(client) => {
                info!(addr = %client.addr, save = %save_id, player = %player_id, "joined");
                client.player_id = Some(player_id);
                client.session_id = Some(save_id);
                if let Some(old) = client.push_task.replace(push_task) {
                    old.abort();
                }
            }
            None => push_task.abort(),
        }
        Ok(())
    }

    async fn leave(&self, connection_id: &str, now: i64) {
        let (player_id, push_task) = {
            let mut clients = self.clients.write().await;
            match clients.get_mut(connection_id) {
                Some(client) => {
                    client.session_id = None;
                    (client.player_id.take(), client.push_task.take())
                }
                None => return,
            }
        };

        if let Some(task) = push_task {
            task.abort();
        }
        if let Some(player_id) = player_id {
            if let Some(save_id) = self.sessions.leave(&player_id, Some(connection_id), now).await {
                debug!(save = %save_id, player = %player_id, "left");
            }
        }
    }

    async fn disconnect(&self, connection_id: &str) {
        self.leave(connection_id, now_millis()).await;
        self.clients.write().await.remove(connection_id);
        debug!(connection = %connection_id, "disconnected");
    }

    async fn with_session<F>(&self, connection_id: &str, f: F) -> Result<(), GameServerError>
    where
        F: FnOnce(&mut GameSession, &str) -> Result<(), SessionError>,
    {
        let (player_id, session_id) = {
            let clients = self.clients.read().await;
            let client = clients.get(connection_id).ok_or(GameServerError::NotJoined)?;
            match (&client.player_id, &client.session_id) {
                (Some(player), Some(session)) => (player.clone(), session.clone()),
                _ => return Err(GameServerError::NotJoined),
            }
        };

        let session = self
            .sessions
            .get_session(&session_id)
            .await
            .ok_or(SessionError::SessionNotFound(session_id))?;
        let mut session = session.write().await;
        f(&mut *session, player_id.as_str())?;
        Ok(())
    }

    async fn send(&self, connection_id: &str, packet: ServerPacket) {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(connection_id).map(|c| c.sender.clone())
        };
        if let Some(sender) = sender {
            let _ = sender.send(packet).await;
        }
    }

    async fn touch(&self, connection_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(connection_id) {
            client.last_activity = Instant::now();
        }
    }

    /// Push loop for one joined connection. Stops when the connection is no
    /// longer the player's current one, or the session closes.
    fn spawn_push_loop(
        &self,
        session: Arc<RwLock<GameSession>>,
        player_id: PlayerId,
        connection_id: String,
        sender: mpsc::Sender<ServerPacket>,
    ) -> JoinHandle<()> {
        let sequence = self.sequence.clone();
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.push_rate.max(1)));

        tokio::spawn(async move {
            let mut push_interval = interval(period);
            push_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                push_interval.tick().await;
                let packet = {
                    let mut session = session.write().await;
                    if session.state == SessionState::Closed || !session.is_connected(&player_id, &connection_id) {
                        break;
                    }
                    session.prepare_push(&player_id, &sequence, now_millis())
                };
                if let Some(packet) = packet {
                    if sender.send(packet).await.is_err() {
                        break;
                    }
                }
            }
            debug!(player = %player_id, connection = %connection_id, "push loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pipeline::ActionBindings;
    use crate::network::protocol::ClientPacket;
    use crate::state::mutation::Mutation;
    use serde_json::json;
    use tokio::time::timeout;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tick_rate: 100,
            push_rate: 100,
            ..Default::default()
        }
    }

    fn score_hooks() -> SessionHooks {
        let mut bindings = ActionBindings::new();
        bindings.bind("score", None, |ctx| {
            let by = ctx.input.get("score")?.as_i64()?;
            Some(Mutation::compute("score", move |v| json!(v.as_i64().unwrap_or(0) + by)))
        });
        SessionHooks {
            bindings: Arc::new(bindings),
            init: Some(Arc::new(|session: &mut GameSession| {
                session.seed(json!({ "score": 0 }));
            })),
            ..Default::default()
        }
    }

    async fn connect(server: &GameServer, id: &str) -> mpsc::Receiver<ServerPacket> {
        let (tx, rx) = mpsc::channel(16);
        server
            .ctx
            .register_client(id, SocketAddr::from(([127, 0, 0, 1], 9)), tx)
            .await;
        rx
    }

    fn message(id: &str, message: ClientMessage) -> TransportEvent {
        TransportEvent::Message {
            connection_id: id.to_string(),
            message,
        }
    }

    fn join(save: &str, player: &str) -> ClientMessage {
        ClientMessage::Join {
            save_id: save.into(),
            player_id: player.into(),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerPacket>) -> ServerPacket {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, crate::TICK_RATE);
        assert_eq!(config.push_rate, crate::PUSH_RATE);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.session.push_mode, PushMode::Delta);
    }

    #[test]
    fn test_env_var_parsing() {
        std::env::set_var("SYNC_TEST_RATE_OK", " 25 ");
        std::env::set_var("SYNC_TEST_RATE_BAD", "fast");
        assert_eq!(env_var::<u32>("SYNC_TEST_RATE_OK").unwrap(), Some(25));
        assert!(matches!(
            env_var::<u32>("SYNC_TEST_RATE_BAD"),
            Err(ConfigError::InvalidValue { var: "SYNC_TEST_RATE_BAD", .. })
        ));
        assert_eq!(env_var::<u32>("SYNC_TEST_RATE_UNSET").unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(test_config(), SessionHooks::default());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = GameServer::new(test_config(), SessionHooks::default());
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_input_before_join_rejected() {
        let server = GameServer::new(test_config(), SessionHooks::default());
        let mut rx = connect(&server, "c1").await;
        server
            .ctx
            .handle_event(message("c1", ClientMessage::Input(ClientPacket::default())))
            .await;
        assert_eq!(recv(&mut rx).await, ServerPacket::error("Not joined to a save"));
    }

    #[tokio::test]
    async fn test_join_snapshot_then_delta() {
        let server = GameServer::new(test_config(), score_hooks());
        let mut rx = connect(&server, "c1").await;

        server.ctx.handle_event(message("c1", join("save", "p1"))).await;
        assert_eq!(recv(&mut rx).await, ServerPacket::Snapshot(json!({ "score": 0 })));

        let packet = ClientPacket {
            id: Some(1),
            input: serde_json::from_value(json!({ "score": 5 })).unwrap(),
            ..Default::default()
        };
        server.ctx.handle_event(message("c1", ClientMessage::Input(packet))).await;
        server.sessions().tick_all(now_millis()).await;

        match recv(&mut rx).await {
            ServerPacket::Delta(delta) => {
                assert_eq!(delta.highest_processed_message, Some(1));
                assert_eq!(delta.change_deltas, vec![json!({ "score": 5 })]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_from_client() {
        let server = GameServer::new(test_config(), score_hooks());
        let mut rx = connect(&server, "c1").await;
        server.ctx.handle_event(message("c1", join("save", "p1"))).await;
        recv(&mut rx).await;

        server.ctx.handle_event(message("c1", ClientMessage::Pause)).await;
        let session = server.sessions().get_session("save").await.unwrap();
        assert_eq!(session.read().await.state, SessionState::Paused);

        server.ctx.handle_event(message("c1", ClientMessage::Unpause)).await;
        assert_eq!(session.read().await.state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_session() {
        let server = GameServer::new(test_config(), score_hooks());
        let mut rx = connect(&server, "c1").await;
        server.ctx.handle_event(message("c1", join("save", "p1"))).await;
        recv(&mut rx).await;

        server
            .ctx
            .handle_event(TransportEvent::Disconnect {
                connection_id: "c1".into(),
            })
            .await;
        assert_eq!(server.connection_count().await, 0);
        let session = server.sessions().get_session("save").await.unwrap();
        assert_eq!(session.read().await.player_count(), 0);
        assert!(server.sessions().get_player_session("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_decode_error_reported() {
        let server = GameServer::new(test_config(), SessionHooks::default());
        let mut rx = connect(&server, "c1").await;
        let event = decode_event("c1", ClientMessage::from_json("{not json"));
        assert!(matches!(event, TransportEvent::Error { .. }));
        server.ctx.handle_event(event).await;
        assert_eq!(recv(&mut rx).await, ServerPacket::error("Invalid message format"));
    }
}
