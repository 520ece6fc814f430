//! Per-game tasks.
//!
//! Every created game runs one task that owns the sessions which joined
//! it. The lobby talks to a game exclusively through the [`GameHandle`];
//! the game talks back exclusively through the [`LobbyLink`] capability,
//! which keeps game reclamation in the lobby loop and out of any lock.
//!
//! Gameplay itself (dealing, betting) is layered on top of this module and
//! out of its scope: the task here owns the connections, keeps the roster
//! consistent and enforces the session protocol.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use protocol::{ErrorCode, ErrorData, GameData, Packet};

use crate::lobby::LobbyLink;
use crate::receiver::{self, RECV_TIMEOUT};
use crate::sender::Sender;
use crate::session::{PlayerData, Session, SessionManager, SocketId};

/// Bound on the shutdown wait for one game task.
pub const GAME_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Game state the lobby may read while the game task runs: the descriptor
/// plus the current roster.
pub struct GameShared {
    id: u32,
    name: String,
    password: String,
    game_data: GameData,
    roster: Mutex<Vec<Arc<PlayerData>>>,
}

impl GameShared {
    fn roster(&self) -> MutexGuard<'_, Vec<Arc<PlayerData>>> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum GameCommand {
    AddSession(Session),
}

/// The lobby's handle to one running game.
pub struct GameHandle {
    shared: Arc<GameShared>,
    commands: mpsc::UnboundedSender<GameCommand>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl GameHandle {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn game_data(&self) -> &GameData {
        &self.shared.game_data
    }

    pub fn check_password(&self, password: &str) -> bool {
        self.shared.password == password
    }

    pub fn player_id_list(&self) -> Vec<u32> {
        self.shared
            .roster()
            .iter()
            .map(|player| player.unique_id)
            .collect()
    }

    pub fn player_data_by_unique_id(&self, player_id: u32) -> Option<Arc<PlayerData>> {
        self.shared
            .roster()
            .iter()
            .find(|player| player.unique_id == player_id)
            .cloned()
    }

    pub fn is_player_connected(&self, name: &str) -> bool {
        self.shared.roster().iter().any(|player| player.name == name)
    }

    /// Transfers ownership of an established session into this game. The
    /// roster is updated immediately so directory packets built right
    /// after the transfer already list the player.
    pub fn add_session(&self, session: Session) {
        let Some(player) = session.state().player_data().cloned() else {
            tracing::warn!(
                socket_id = session.socket_id().0,
                "Dropping identity-less session handed to a game"
            );
            return;
        };
        self.shared.roster().push(player.clone());
        if self.commands.send(GameCommand::AddSession(session)).is_err() {
            // The task is already gone; the lobby will reap this game.
            self.shared
                .roster()
                .retain(|entry| entry.unique_id != player.unique_id);
        }
    }

    /// Flags the game task to stop. Idempotent.
    pub fn signal_termination(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Whether the game task has already exited (normally or by panic).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits up to `timeout` for the task to exit. Returns false if the
    /// task had to be detached.
    pub async fn join(self, timeout: Duration) -> bool {
        time::timeout(timeout, self.join).await.is_ok()
    }
}

/// Spawns the task for a freshly created game and returns its handle.
pub fn start_game(
    id: u32,
    name: String,
    password: String,
    game_data: GameData,
    sender: Sender,
    lobby: LobbyLink,
) -> GameHandle {
    let shared = Arc::new(GameShared {
        id,
        name,
        password,
        game_data,
        roster: Mutex::new(Vec::new()),
    });
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = GameTask {
        shared: shared.clone(),
        sessions: SessionManager::new(),
        commands: command_rx,
        shutdown: shutdown_rx,
        sender,
        lobby,
        seen_first_session: false,
    };
    let join = tokio::spawn(task.run());
    GameHandle {
        shared,
        commands: command_tx,
        shutdown: shutdown_tx,
        join,
    }
}

struct GameTask {
    shared: Arc<GameShared>,
    sessions: SessionManager,
    commands: mpsc::UnboundedReceiver<GameCommand>,
    shutdown: watch::Receiver<bool>,
    sender: Sender,
    lobby: LobbyLink,
    /// The first session is the creator; their arrival is already covered
    /// by the directory broadcast, so no join notification goes out.
    seen_first_session: bool,
}

impl GameTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(GameCommand::AddSession(session)) => self.handle_add_session(session),
                    None => break,
                },
                ready = self.sessions.select_ready(RECV_TIMEOUT) => {
                    if let Some(socket_id) = ready {
                        self.process_session(socket_id).await;
                    }
                }
            }
        }
        // Closes the remaining game sockets.
        self.sessions.clear();
        self.shared.roster().clear();
        tracing::debug!(game_id = self.shared.id, "Game task stopped");
    }

    fn handle_add_session(&mut self, session: Session) {
        // The handle has already placed the player on the roster.
        let player = session.state().player_data().cloned();
        let socket_id = session.socket_id();
        if let Err(err) = self.sessions.add_session(session) {
            tracing::error!(?err, socket_id = socket_id.0, "Rejecting session transfer");
            return;
        }
        if let Some(player) = player {
            tracing::info!(
                game_id = self.shared.id,
                player = %player.name,
                "Player entered the game"
            );
            if self.seen_first_session {
                self.lobby
                    .notify_player_joined(self.shared.id, player.unique_id, player.name.clone());
            }
        }
        self.seen_first_session = true;
    }

    async fn process_session(&mut self, socket_id: SocketId) {
        let Some(session) = self.sessions.session_mut(socket_id) else {
            return;
        };
        match receiver::recv_packet(session, RECV_TIMEOUT).await {
            Ok(None) => {}
            Ok(Some(packet)) => self.dispatch(socket_id, packet),
            Err(err) => {
                tracing::debug!(
                    %err,
                    game_id = self.shared.id,
                    socket_id = socket_id.0,
                    "Game session read failed"
                );
                self.drop_session(socket_id);
            }
        }
    }

    fn dispatch(&mut self, socket_id: SocketId, packet: Packet) {
        match packet {
            // Lobby handshake traffic is not legal once a session is in a
            // game.
            Packet::Init(_) | Packet::CreateGame(_) | Packet::JoinGame(_) => {
                if let Some(session) = self.sessions.session(socket_id) {
                    self.sender.send(
                        session,
                        Packet::Error(ErrorData {
                            error_code: ErrorCode::InvalidState,
                        }),
                    );
                }
                self.drop_session(socket_id);
            }
            // Everything else belongs to the table logic layered on top.
            other => {
                tracing::trace!(
                    game_id = self.shared.id,
                    kind = other.kind_name(),
                    "Gameplay packet outside the lobby contract"
                );
            }
        }
    }

    fn drop_session(&mut self, socket_id: SocketId) {
        let Some(session) = self.sessions.remove_session(socket_id) else {
            return;
        };
        if let Some(player) = session.state().player_data() {
            self.shared
                .roster()
                .retain(|entry| entry.unique_id != player.unique_id);
            self.lobby
                .notify_player_left(self.shared.id, player.unique_id, player.name.clone());
        }
        if self.sessions.session_count() == 0 {
            // The last player is gone; ask the lobby to reap this game.
            self.lobby.remove_game(self.shared.id);
        }
    }
}
