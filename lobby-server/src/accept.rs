//! The accept task: turns raw connections into lobby work.
//!
//! No protocol work happens here. Every accepted socket is wrapped in a
//! [`ConnectData`] and pushed into the lobby's connect queue; a full queue
//! makes the acceptor wait, which is the server's admission backpressure.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::callback::SharedCallback;
use crate::error::NetError;
use crate::lobby::ConnectData;

/// Bound on the shutdown wait for the accept task.
pub const ACCEPT_TERMINATE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Binds the listener: the IPv4 wildcard by default, the IPv6 wildcard
/// dual-stack when requested (IPv4 clients are still served then).
pub async fn bind_listener(port: u16, use_ipv6: bool) -> Result<TcpListener, NetError> {
    let addr: SocketAddr = if use_ipv6 {
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    TcpListener::bind(addr).await.map_err(NetError::Bind)
}

/// Owner-side handle of the accept task.
pub struct AcceptHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AcceptHandle {
    /// Flags the task to close the listener and exit. Idempotent.
    pub fn signal_termination(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits up to `timeout` for the task to exit. Returns false if the
    /// task had to be detached.
    pub async fn join(self, timeout: Duration) -> bool {
        time::timeout(timeout, self.join).await.is_ok()
    }
}

/// Starts accepting on an already bound listener.
pub fn start_accept(
    listener: TcpListener,
    connect_queue: mpsc::Sender<ConnectData>,
    callback: SharedCallback,
) -> AcceptHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(accept_loop(listener, connect_queue, callback, shutdown_rx));
    AcceptHandle {
        shutdown: shutdown_tx,
        join,
    }
}

async fn accept_loop(
    listener: TcpListener,
    connect_queue: mpsc::Sender<ConnectData>,
    callback: SharedCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(%peer_addr, "Accepted connection");
                    if connect_queue
                        .send(ConnectData { stream, peer_addr })
                        .await
                        .is_err()
                    {
                        // The lobby is gone; nothing left to accept for.
                        break;
                    }
                }
                Err(err) => {
                    let err = NetError::Accept(err);
                    tracing::warn!(%err, "Accept failed");
                    callback.signal_net_server_error(err.error_id(), err.os_error_code());
                }
            },
        }
    }
    // The listener closes on drop.
    tracing::debug!("Accept task stopped");
}
