//! The lobby task: the orchestrator of the server.
//!
//! One loop drives everything, in a fixed order per iteration: admit at
//! most one new connection, serve one ready session through the protocol
//! state machine, expire deferred closes, then process game
//! notifications. Cross-task calls into the lobby (new connections, game
//! removal, join/leave fan-out) are one-way channel messages consumed by
//! the next iteration, so no caller ever blocks on lobby internals.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use protocol::{
    AI_NAME_PREFIX, CreateGameData, ErrorCode, ErrorData, GameInfo, GameListMode,
    GameListNewData, GameListPlayerJoinedData, GameListPlayerLeftData, GameListUpdateData,
    InitAckData, InitData, JoinGameData, MAX_NAME_SIZE, NET_VERSION_MAJOR, Packet,
    PlayerInfoData, PlayerType, RetrievePlayerInfoData,
};

use crate::callback::SharedCallback;
use crate::config::ServerConfig;
use crate::game::{self, GAME_TERMINATE_TIMEOUT, GameHandle};
use crate::receiver::{self, RECV_TIMEOUT};
use crate::sender::{self, IgnoreSendErrors, SENDER_TERMINATE_TIMEOUT, Sender, SenderHandle};
use crate::session::{
    PlayerData, PlayerRights, SESSION_ID_REJECTED, Session, SessionManager, SocketId, StateFilter,
};

/// Maximum number of sessions registered with the lobby at once. The
/// connection over the limit is told so and dropped.
pub const MAX_SESSIONS: usize = 64;

/// Capacity of the connect queue. A full queue backpressures the acceptor.
pub const CONNECT_QUEUE_SIZE: usize = 16;

/// Bound on a full lobby shutdown (games, sender and sessions included).
pub const LOBBY_TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A freshly accepted connection on its way to the lobby.
pub struct ConnectData {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// One-way messages into the lobby loop.
enum LobbyMessage {
    RemoveGame {
        game_id: u32,
    },
    PlayerJoinedGame {
        game_id: u32,
        player_id: u32,
        player_name: String,
    },
    PlayerLeftGame {
        game_id: u32,
        player_id: u32,
        player_name: String,
    },
}

/// Narrow capability handed to game tasks for calling back into the
/// lobby. Cheap to clone; every call is a non-blocking enqueue.
#[derive(Clone)]
pub struct LobbyLink {
    messages: mpsc::UnboundedSender<LobbyMessage>,
}

impl LobbyLink {
    /// Asks the lobby to tear this game down on its next iteration.
    pub fn remove_game(&self, game_id: u32) {
        let _ = self.messages.send(LobbyMessage::RemoveGame { game_id });
    }

    pub fn notify_player_joined(&self, game_id: u32, player_id: u32, player_name: String) {
        let _ = self.messages.send(LobbyMessage::PlayerJoinedGame {
            game_id,
            player_id,
            player_name,
        });
    }

    pub fn notify_player_left(&self, game_id: u32, player_id: u32, player_name: String) {
        let _ = self.messages.send(LobbyMessage::PlayerLeftGame {
            game_id,
            player_id,
            player_name,
        });
    }
}

/// Owner-side handle of the lobby task.
pub struct LobbyHandle {
    connect_queue: mpsc::Sender<ConnectData>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LobbyHandle {
    /// The queue endpoint the acceptor feeds.
    pub fn connection_sink(&self) -> mpsc::Sender<ConnectData> {
        self.connect_queue.clone()
    }

    /// Flags the lobby to shut down. Idempotent.
    pub fn signal_termination(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits up to `timeout` for the lobby to finish its teardown. Returns
    /// false if the task had to be detached.
    pub async fn join(self, timeout: Duration) -> bool {
        time::timeout(timeout, self.join).await.is_ok()
    }
}

/// Spawns the lobby task (and with it the sender worker).
pub fn start_lobby(config: &ServerConfig, callback: SharedCallback) -> LobbyHandle {
    let (connect_tx, connect_rx) = mpsc::channel(CONNECT_QUEUE_SIZE);
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sender, sender_handle) = sender::start(Arc::new(IgnoreSendErrors));
    let task = LobbyTask {
        password: config.server_password.clone(),
        close_delay: config.close_session_delay(),
        callback,
        sender,
        sender_handle,
        sessions: SessionManager::new(),
        games: HashMap::new(),
        close_list: Vec::new(),
        connect_queue: connect_rx,
        messages: message_rx,
        link: LobbyLink {
            messages: message_tx,
        },
        shutdown: shutdown_rx,
        socket_counter: 0,
        player_counter: 0,
        game_counter: 0,
    };
    let join = tokio::spawn(task.run());
    LobbyHandle {
        connect_queue: connect_tx,
        shutdown: shutdown_tx,
        join,
    }
}

struct LobbyTask {
    password: String,
    close_delay: Duration,
    callback: SharedCallback,
    sender: Sender,
    sender_handle: SenderHandle,
    sessions: SessionManager,
    games: HashMap<u32, GameHandle>,
    /// Sessions waiting out the grace period before their socket closes.
    close_list: Vec<(Instant, Session)>,
    connect_queue: mpsc::Receiver<ConnectData>,
    messages: mpsc::UnboundedReceiver<LobbyMessage>,
    link: LobbyLink,
    shutdown: watch::Receiver<bool>,
    socket_counter: u64,
    player_counter: u32,
    game_counter: u32,
}

impl LobbyTask {
    async fn run(mut self) {
        while !*self.shutdown.borrow() {
            // Handle one incoming connection at a time.
            if let Ok(data) = self.connect_queue.try_recv() {
                self.handle_new_connection(data);
            }
            self.process_loop().await;
            self.close_session_loop();
            self.message_loop().await;
            self.reap_finished_games().await;
        }
        self.terminate().await;
    }

    // ---- admission -----------------------------------------------------

    fn handle_new_connection(&mut self, data: ConnectData) {
        let socket_id = self.alloc_socket_id();
        if self.sessions.session_count() >= MAX_SESSIONS {
            // Admitted only long enough to learn that the server is full.
            let session = Session::new(socket_id, SESSION_ID_REJECTED, data.stream, data.peer_addr);
            tracing::info!(peer = %data.peer_addr, "Rejecting connection, server is full");
            self.send_error_to(&session, ErrorCode::ServerFull);
            self.close_session_delayed(session);
            return;
        }
        let session_id = self.generate_session_id();
        let session = Session::new(socket_id, session_id, data.stream, data.peer_addr);
        tracing::debug!(
            socket_id = socket_id.0,
            peer = %data.peer_addr,
            "Session registered"
        );
        if let Err(err) = self.sessions.add_session(session) {
            tracing::error!(?err, "Failed to register a new session");
        }
    }

    /// Random non-zero session id not carried by any live session. The id
    /// is meant to support a later reconnect feature.
    fn generate_session_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != SESSION_ID_REJECTED && !self.sessions.session_id_in_use(id) {
                return id;
            }
        }
    }

    fn alloc_socket_id(&mut self) -> SocketId {
        self.socket_counter += 1;
        SocketId(self.socket_counter)
    }

    fn alloc_player_id(&mut self) -> u32 {
        self.player_counter += 1;
        self.player_counter
    }

    fn alloc_game_id(&mut self) -> u32 {
        self.game_counter += 1;
        self.game_counter
    }

    // ---- packet processing ---------------------------------------------

    async fn process_loop(&mut self) {
        let Some(socket_id) = self.sessions.select_ready(RECV_TIMEOUT).await else {
            return;
        };
        let Some(session) = self.sessions.session_mut(socket_id) else {
            return;
        };
        match receiver::recv_packet(session, RECV_TIMEOUT).await {
            Ok(None) => {}
            Ok(Some(packet)) => self.dispatch(socket_id, packet),
            Err(err) => {
                tracing::debug!(%err, socket_id = socket_id.0, "Session read failed");
                self.close_registered_session(socket_id);
            }
        }
    }

    fn dispatch(&mut self, socket_id: SocketId, packet: Packet) {
        let established = match self.sessions.session(socket_id) {
            Some(session) => session.state().is_established(),
            None => return,
        };
        match packet {
            Packet::Init(data) => {
                if established {
                    self.session_error(socket_id, ErrorCode::InvalidState);
                } else {
                    self.handle_init(socket_id, data);
                }
            }
            other if !established => {
                tracing::debug!(
                    socket_id = socket_id.0,
                    kind = other.kind_name(),
                    "Packet before handshake"
                );
                self.session_error(socket_id, ErrorCode::InvalidState);
            }
            Packet::RetrievePlayerInfo(data) => self.handle_retrieve_player_info(socket_id, data),
            Packet::CreateGame(data) => self.handle_create_game(socket_id, data),
            Packet::JoinGame(data) => self.handle_join_game(socket_id, data),
            other => {
                // Unknown but well-formed traffic is tolerated.
                tracing::trace!(
                    socket_id = socket_id.0,
                    kind = other.kind_name(),
                    "Ignoring unexpected lobby packet"
                );
            }
        }
    }

    fn handle_init(&mut self, socket_id: SocketId, data: InitData) {
        if data.version_major != NET_VERSION_MAJOR {
            self.session_error(socket_id, ErrorCode::VersionNotSupported);
            return;
        }
        if data.password != self.password {
            self.session_error(socket_id, ErrorCode::InvalidPassword);
            return;
        }
        if !valid_player_name(&data.player_name) {
            self.session_error(socket_id, ErrorCode::InvalidPlayerName);
            return;
        }
        if self.is_player_connected(&data.player_name) {
            self.session_error(socket_id, ErrorCode::PlayerNameInUse);
            return;
        }

        let player = Arc::new(PlayerData {
            unique_id: self.alloc_player_id(),
            name: data.player_name,
            player_type: PlayerType::Human,
            rights: PlayerRights::Normal,
        });

        // Confirmation first, then the current game directory, then the
        // state switch.
        let Some(session) = self.sessions.session(socket_id) else {
            return;
        };
        self.sender.send(
            session,
            Packet::InitAck(InitAckData {
                session_id: session.session_id(),
                player_id: player.unique_id,
            }),
        );
        for game in self.games.values() {
            self.sender.send(session, game_list_new_packet(game));
        }

        if let Err(err) = self.sessions.set_player_data(socket_id, player.clone()) {
            tracing::error!(?err, socket_id = socket_id.0, "Failed to establish session");
            self.close_registered_session(socket_id);
            return;
        }
        self.callback.signal_net_server_player_joined(&player.name);
        tracing::info!(
            player = %player.name,
            player_id = player.unique_id,
            "Player entered the lobby"
        );
    }

    fn handle_retrieve_player_info(&mut self, socket_id: SocketId, data: RetrievePlayerInfoData) {
        // In the lobby first, then in every game.
        let player = self
            .sessions
            .session_by_player_id(data.player_id)
            .and_then(|session| session.state().player_data().cloned())
            .or_else(|| {
                self.games
                    .values()
                    .find_map(|game| game.player_data_by_unique_id(data.player_id))
            });
        match player {
            Some(player) => {
                if let Some(session) = self.sessions.session(socket_id) {
                    self.sender.send(
                        session,
                        Packet::PlayerInfo(PlayerInfoData {
                            player_id: player.unique_id,
                            player_name: player.name.clone(),
                            player_type: player.player_type,
                        }),
                    );
                }
            }
            // Most likely a lookup racing a disconnect; not worth an error
            // packet.
            None => tracing::debug!(
                player_id = data.player_id,
                "Player info request for an unknown id"
            ),
        }
    }

    fn handle_create_game(&mut self, socket_id: SocketId, data: CreateGameData) {
        let Some(session) = self.sessions.remove_session(socket_id) else {
            return;
        };
        let game_id = self.alloc_game_id();
        tracing::info!(game_id, game_name = %data.game_name, "Creating game");
        let game = game::start_game(
            game_id,
            data.game_name,
            data.password,
            data.game_data,
            self.sender.clone(),
            self.link.clone(),
        );
        game.add_session(session);
        // The creator is already inside the game, so this reaches the
        // remaining lobby sessions only.
        self.sessions
            .broadcast(&self.sender, &game_list_new_packet(&game), StateFilter::Established);
        self.games.insert(game_id, game);
    }

    fn handle_join_game(&mut self, socket_id: SocketId, data: JoinGameData) {
        if !self.games.contains_key(&data.game_id) {
            self.send_error(socket_id, ErrorCode::UnknownGame);
            return;
        }
        if !self.games[&data.game_id].check_password(&data.password) {
            self.send_error(socket_id, ErrorCode::InvalidPassword);
            return;
        }
        let Some(session) = self.sessions.remove_session(socket_id) else {
            return;
        };
        if let Some(game) = self.games.get(&data.game_id) {
            game.add_session(session);
        }
    }

    fn is_player_connected(&self, name: &str) -> bool {
        self.sessions.is_player_connected(name)
            || self.games.values().any(|game| game.is_player_connected(name))
    }

    // ---- error paths and deferred close --------------------------------

    /// Sends an error packet without touching the session state. Join
    /// failures use this: the session stays established in the lobby.
    fn send_error(&self, socket_id: SocketId, code: ErrorCode) {
        if let Some(session) = self.sessions.session(socket_id) {
            self.send_error_to(session, code);
        }
    }

    fn send_error_to(&self, session: &Session, code: ErrorCode) {
        self.sender
            .send(session, Packet::Error(ErrorData { error_code: code }));
    }

    /// Terminal rejection: one error packet, then the deferred teardown.
    fn session_error(&mut self, socket_id: SocketId, code: ErrorCode) {
        self.send_error(socket_id, code);
        self.close_registered_session(socket_id);
    }

    fn close_registered_session(&mut self, socket_id: SocketId) {
        if let Some(session) = self.sessions.remove_session(socket_id) {
            self.close_session_delayed(session);
        }
    }

    /// Parks the session on the close list. The grace period gives the
    /// sender time to flush final packets before the socket goes away.
    fn close_session_delayed(&mut self, session: Session) {
        if let Some(player) = session.state().player_data() {
            self.callback.signal_net_server_player_left(&player.name);
            tracing::info!(player = %player.name, "Player left the lobby");
        }
        self.close_list.push((Instant::now(), session));
    }

    fn close_session_loop(&mut self) {
        let delay = self.close_delay;
        // Dropping the session closes its socket once the sender holds no
        // more queued frames for it.
        self.close_list.retain(|(since, _)| since.elapsed() < delay);
    }

    // ---- game notifications and reclamation ----------------------------

    async fn message_loop(&mut self) {
        while let Ok(message) = self.messages.try_recv() {
            match message {
                LobbyMessage::PlayerJoinedGame {
                    game_id,
                    player_id,
                    player_name,
                } => {
                    tracing::debug!(game_id, player = %player_name, "Announcing game join");
                    self.sessions.broadcast(
                        &self.sender,
                        &Packet::GameListPlayerJoined(GameListPlayerJoinedData {
                            game_id,
                            player_id,
                        }),
                        StateFilter::Established,
                    );
                }
                LobbyMessage::PlayerLeftGame {
                    game_id,
                    player_id,
                    player_name,
                } => {
                    self.sessions.broadcast(
                        &self.sender,
                        &Packet::GameListPlayerLeft(GameListPlayerLeftData { game_id, player_id }),
                        StateFilter::Established,
                    );
                    self.callback.signal_net_server_player_left(&player_name);
                }
                LobbyMessage::RemoveGame { game_id } => self.remove_game(game_id).await,
            }
        }
    }

    /// Synchronous teardown of one game, done from the lobby loop so no
    /// lock is held across the join.
    async fn remove_game(&mut self, game_id: u32) {
        let Some(game) = self.games.remove(&game_id) else {
            return;
        };
        game.signal_termination();
        if !game.join(GAME_TERMINATE_TIMEOUT).await {
            tracing::warn!(game_id, "Game task did not terminate in time, detaching");
        }
        self.sessions.broadcast(
            &self.sender,
            &Packet::GameListUpdate(GameListUpdateData {
                game_id,
                mode: GameListMode::Closed,
            }),
            StateFilter::Established,
        );
        tracing::info!(game_id, "Game closed");
    }

    /// Fallback for games whose task died without asking for removal
    /// (e.g. a panic in the table logic). The rest of the server keeps
    /// running.
    async fn reap_finished_games(&mut self) {
        let dead: Vec<u32> = self
            .games
            .iter()
            .filter(|(_, game)| game.is_finished())
            .map(|(game_id, _)| *game_id)
            .collect();
        for game_id in dead {
            tracing::warn!(game_id, "Reaping dead game");
            self.remove_game(game_id).await;
        }
    }

    // ---- shutdown ------------------------------------------------------

    async fn terminate(mut self) {
        tracing::info!("Lobby shutting down");
        let games: Vec<GameHandle> = self.games.drain().map(|(_, game)| game).collect();
        for game in &games {
            game.signal_termination();
        }
        for game in games {
            if !game.join(GAME_TERMINATE_TIMEOUT).await {
                tracing::warn!("Game task did not terminate in time, detaching");
            }
        }
        self.sender_handle.signal_termination();
        self.sender_handle.join(SENDER_TERMINATE_TIMEOUT).await;
        self.connect_queue.close();
        while self.connect_queue.try_recv().is_ok() {}
        self.close_list.clear();
        self.sessions.clear();
    }
}

/// Naming rules for players: non-empty, bounded, not starting with the
/// list-control character `#` and not impersonating server-created AI
/// players.
fn valid_player_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_SIZE
        && !name.starts_with('#')
        && !name.starts_with(AI_NAME_PREFIX)
}

fn game_list_new_packet(game: &GameHandle) -> Packet {
    Packet::GameListNew(GameListNewData {
        game_id: game.id(),
        game_info: GameInfo {
            mode: GameListMode::Created,
            name: game.name().to_string(),
            data: game.game_data().clone(),
            players: game.player_id_list(),
        },
    })
}
