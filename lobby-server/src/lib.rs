//! Networking core of the card-table server: the acceptor, the lobby with
//! its per-session protocol state machine and game directory, the outbound
//! sender worker and the per-game tasks.

pub mod accept;
pub mod callback;
pub mod config;
pub mod error;
pub mod game;
pub mod lobby;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
