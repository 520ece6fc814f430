use std::path::Path;
use std::sync::Arc;

use lobby_server::callback::TracingCallback;
use lobby_server::config::ServerConfig;
use lobby_server::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration file looked up next to the binary.
const CONFIG_FILE: &str = "ServerConfig.json";

#[tokio::main]
/// Activates error tracing, loads the configuration if one is present and
/// runs the lobby server until ctrl-c.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true) // Module path (e.g. lobby_server::lobby)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true), // Thread-Name
        )
        .init();

    let config_path = Path::new(CONFIG_FILE);
    let config = if config_path.exists() {
        match ServerConfig::load(config_path).await {
            Ok(config) => config,
            Err(message) => {
                tracing::error!(message, "Config load error.");
                panic!("Config load error: {}", message);
            }
        }
    } else {
        ServerConfig::default()
    };

    let server = match Server::start(config, Arc::new(TracingCallback)).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "Server start failed.");
            panic!("Server start failed: {}", err);
        }
    };

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down.");
    server.shutdown().await;
}
