//! Wiring of acceptor, lobby and sender into one running server.

use std::net::SocketAddr;

use crate::accept::{self, ACCEPT_TERMINATE_TIMEOUT, AcceptHandle};
use crate::callback::{ACTION_SERVER_STARTED, SharedCallback};
use crate::config::ServerConfig;
use crate::error::NetError;
use crate::lobby::{self, LOBBY_TERMINATE_TIMEOUT, LobbyHandle};

pub struct Server {
    local_addr: SocketAddr,
    lobby: LobbyHandle,
    accept: AcceptHandle,
}

impl Server {
    /// Binds the listener and spawns all server tasks. Returns once the
    /// server is reachable.
    pub async fn start(config: ServerConfig, callback: SharedCallback) -> Result<Server, NetError> {
        let listener = match accept::bind_listener(config.port, config.use_ipv6).await {
            Ok(listener) => listener,
            Err(err) => {
                callback.signal_net_server_error(err.error_id(), err.os_error_code());
                return Err(err);
            }
        };
        let local_addr = listener.local_addr().map_err(NetError::Bind)?;

        let lobby = lobby::start_lobby(&config, callback.clone());
        let accept = accept::start_accept(listener, lobby.connection_sink(), callback.clone());
        callback.signal_net_server_success(ACTION_SERVER_STARTED);
        tracing::info!(%local_addr, "Lobby server listening");

        Ok(Server {
            local_addr,
            lobby,
            accept,
        })
    }

    /// The bound listener address; useful with a configured port of 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ordered shutdown: stop accepting first, then the lobby (which stops
    /// the games and drains the sender).
    pub async fn shutdown(self) {
        self.accept.signal_termination();
        if !self.accept.join(ACCEPT_TERMINATE_TIMEOUT).await {
            tracing::warn!("Accept task did not terminate in time, detaching");
        }
        self.lobby.signal_termination();
        if !self.lobby.join(LOBBY_TERMINATE_TIMEOUT).await {
            tracing::warn!("Lobby task did not terminate in time, detaching");
        }
    }
}
