//! Server configuration with an optional JSON file on top of built-in
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

/// Default listening port of the lobby server.
pub const DEFAULT_PORT: u16 = 7234;

/// Default grace period between a terminal error packet and the socket
/// teardown, so the sender can flush the packet first.
pub const CLOSE_SESSION_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port of the listener.
    pub port: u16,
    /// Bind the IPv6 wildcard address dual-stack instead of IPv4 only.
    pub use_ipv6: bool,
    /// Password clients must present during the handshake. Empty keeps the
    /// server open.
    pub server_password: String,
    /// Seconds an errored session lingers before its socket is closed.
    pub close_session_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            use_ipv6: false,
            server_password: String::new(),
            close_session_delay_secs: CLOSE_SESSION_DELAY.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Reads the configuration from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, String> {
        let json_content = fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read file: {}", e))?;
        serde_json::from_str(&json_content).map_err(|e| format!("Failed to parse JSON: {}", e))
    }

    pub fn close_session_delay(&self) -> Duration {
        Duration::from_secs(self.close_session_delay_secs)
    }
}
