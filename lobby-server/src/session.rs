//! Sessions and the in-memory session registry.
//!
//! A [`Session`] owns its connection and is a move-only value: at every
//! quiescent point exactly one of the session manager, a game task or the
//! lobby's deferred-close list holds it. The [`SessionManager`] keeps the
//! lobby's sessions with secondary indices by player id and player name,
//! and provides the readiness select the lobby and game loops are built
//! on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tokio::time;

use protocol::{Packet, PlayerType};

use crate::sender::{Sender, SharedWriter};

/// Process-unique key of a connection. This is the "socket" all session
/// maps are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

/// Session id of connections that are rejected before registration.
pub const SESSION_ID_REJECTED: u32 = 0;

/// Access level of a connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerRights {
    Normal,
    Admin,
}

/// Identity attached to a session by a successful handshake. Immutable,
/// shared between the session, game rosters and info lookups.
#[derive(Debug)]
pub struct PlayerData {
    pub unique_id: u32,
    pub name: String,
    pub player_type: PlayerType,
    pub rights: PlayerRights,
}

/// Handshake progress of a session. Only `Established` carries an
/// identity, so an established session without player data cannot be
/// constructed.
#[derive(Debug, Clone)]
pub enum SessionState {
    Init,
    Established(Arc<PlayerData>),
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established(_))
    }

    pub fn player_data(&self) -> Option<&Arc<PlayerData>> {
        match self {
            SessionState::Init => None,
            SessionState::Established(player) => Some(player),
        }
    }
}

/// Filter for broadcasts: only sessions in the matching state receive the
/// packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    Init,
    Established,
}

impl StateFilter {
    fn matches(self, state: &SessionState) -> bool {
        match self {
            StateFilter::Init => !state.is_established(),
            StateFilter::Established => state.is_established(),
        }
    }
}

/// One connected client.
///
/// The read half stays private to the owning loop; the write half is
/// shared with the sender worker, which keeps the socket writable until
/// every queued packet for it is flushed.
pub struct Session {
    socket_id: SocketId,
    session_id: u32,
    peer_addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: SharedWriter,
    state: SessionState,
}

impl Session {
    pub fn new(socket_id: SocketId, session_id: u32, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            socket_id,
            session_id,
            peer_addr,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            state: SessionState::Init,
        }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handle for the sender worker.
    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    pub fn reader_mut(&mut self) -> &mut OwnedReadHalf {
        &mut self.reader
    }

    /// Resolves when the socket has data to read (or failed; the caller
    /// finds out by reading).
    pub async fn readable(&self) {
        let _ = self.reader.readable().await;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("socket id already registered")]
    DuplicateSocket,
    #[error("no session registered for the socket id")]
    UnknownSocket,
    #[error("player id already registered")]
    DuplicatePlayerId,
    #[error("player name already registered")]
    DuplicateName,
}

/// The session registry: primary map keyed by socket id plus player-id and
/// player-name indices. Each instance is confined to its owning task, so
/// all mutation goes through `&mut self` without further locking.
pub struct SessionManager {
    sessions: HashMap<SocketId, Session>,
    by_player_id: HashMap<u32, SocketId>,
    by_name: HashMap<String, SocketId>,
    /// Round-robin pivot so `select_ready` does not starve high ids.
    last_ready: Option<SocketId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_player_id: HashMap::new(),
            by_name: HashMap::new(),
            last_ready: None,
        }
    }

    /// Registers a session in `Init` state.
    pub fn add_session(&mut self, session: Session) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&session.socket_id()) {
            return Err(RegistryError::DuplicateSocket);
        }
        self.sessions.insert(session.socket_id(), session);
        Ok(())
    }

    /// Removes a session from all indices without closing its socket, and
    /// hands it back to the caller.
    pub fn remove_session(&mut self, socket_id: SocketId) -> Option<Session> {
        let session = self.sessions.remove(&socket_id)?;
        if let Some(player) = session.state().player_data() {
            self.by_player_id.remove(&player.unique_id);
            self.by_name.remove(&player.name);
        }
        Some(session)
    }

    /// Attaches an identity and switches the session to `Established`.
    pub fn set_player_data(
        &mut self,
        socket_id: SocketId,
        player: Arc<PlayerData>,
    ) -> Result<(), RegistryError> {
        if self.by_player_id.contains_key(&player.unique_id) {
            return Err(RegistryError::DuplicatePlayerId);
        }
        if self.by_name.contains_key(&player.name) {
            return Err(RegistryError::DuplicateName);
        }
        let session = self
            .sessions
            .get_mut(&socket_id)
            .ok_or(RegistryError::UnknownSocket)?;
        self.by_player_id.insert(player.unique_id, socket_id);
        self.by_name.insert(player.name.clone(), socket_id);
        session.state = SessionState::Established(player);
        Ok(())
    }

    pub fn session(&self, socket_id: SocketId) -> Option<&Session> {
        self.sessions.get(&socket_id)
    }

    pub fn session_mut(&mut self, socket_id: SocketId) -> Option<&mut Session> {
        self.sessions.get_mut(&socket_id)
    }

    /// Established session of the player with the given unique id, if the
    /// player is in this registry.
    pub fn session_by_player_id(&self, player_id: u32) -> Option<&Session> {
        let socket_id = self.by_player_id.get(&player_id)?;
        self.sessions.get(socket_id)
    }

    /// Whether a player with that exact name is registered here.
    pub fn is_player_connected(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Whether any registered session carries the given session id.
    pub fn session_id_in_use(&self, session_id: u32) -> bool {
        self.sessions
            .values()
            .any(|session| session.session_id() == session_id)
    }

    /// Number of registered sessions, `Init` state included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Waits up to `timeout` for a session with readable data and returns
    /// it. Polling starts after the session served last time, which keeps
    /// a chatty low-id session from starving the rest.
    pub async fn select_ready(&mut self, timeout: Duration) -> Option<SocketId> {
        if self.sessions.is_empty() {
            time::sleep(timeout).await;
            return None;
        }
        let mut keys: Vec<SocketId> = self.sessions.keys().copied().collect();
        keys.sort_unstable();
        if let Some(last) = self.last_ready {
            let pivot = keys.iter().position(|key| *key > last).unwrap_or(0);
            keys.rotate_left(pivot);
        }
        let ready = {
            let waiters = keys
                .iter()
                .map(|key| {
                    let session = &self.sessions[key];
                    let key = *key;
                    Box::pin(async move {
                        session.readable().await;
                        key
                    })
                })
                .collect::<Vec<_>>();
            match time::timeout(timeout, select_all(waiters)).await {
                Ok((key, _, _)) => Some(key),
                Err(_) => None,
            }
        };
        if let Some(key) = ready {
            self.last_ready = Some(key);
        }
        ready
    }

    /// Enqueues `packet` to every session whose state matches `filter`.
    pub fn broadcast(&self, sender: &Sender, packet: &Packet, filter: StateFilter) {
        for session in self.sessions.values() {
            if filter.matches(session.state()) {
                sender.send(session, packet.clone());
            }
        }
    }

    /// Drops all sessions, closing their sockets.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_player_id.clear();
        self.by_name.clear();
        self.last_ready = None;
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
