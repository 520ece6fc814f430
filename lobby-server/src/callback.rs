//! Notification sink towards the embedding GUI.
//!
//! The server never talks to a user interface directly; it reports through
//! this trait. Implementations are invoked from the lobby and accept tasks
//! and must not block.

use std::sync::Arc;

/// Action id reported once the listener is bound and the server is serving.
pub const ACTION_SERVER_STARTED: u16 = 1;

pub trait ServerCallback: Send + Sync {
    /// A server action completed, identified by its action id.
    fn signal_net_server_success(&self, action_id: u16);
    /// A transport failure, with the stable error id and the OS error code.
    fn signal_net_server_error(&self, error_id: u16, os_error_id: i32);
    /// A player completed the handshake.
    fn signal_net_server_player_joined(&self, player_name: &str);
    /// A connected player is gone.
    fn signal_net_server_player_left(&self, player_name: &str);
}

pub type SharedCallback = Arc<dyn ServerCallback>;

/// Default callback of the standalone binary: forwards everything to the
/// log.
pub struct TracingCallback;

impl ServerCallback for TracingCallback {
    fn signal_net_server_success(&self, action_id: u16) {
        tracing::info!(action_id, "Server action succeeded");
    }

    fn signal_net_server_error(&self, error_id: u16, os_error_id: i32) {
        tracing::error!(error_id, os_error_id, "Server error");
    }

    fn signal_net_server_player_joined(&self, player_name: &str) {
        tracing::info!(player_name, "Player joined");
    }

    fn signal_net_server_player_left(&self, player_name: &str) {
        tracing::info!(player_name, "Player left");
    }
}
