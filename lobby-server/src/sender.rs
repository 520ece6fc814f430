//! The outbound-write worker.
//!
//! One sender services the whole process. [`Sender::send`] only enqueues
//! and never blocks; a single background task drains the queue in order
//! and writes the frames, which gives every socket its packets in enqueue
//! order. Write failures go to the [`SenderCallback`]; the server installs
//! [`IgnoreSendErrors`] so a broken connection is cleaned up exactly once,
//! by the read path.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use protocol::{Packet, encode_packet};

use crate::error::NetError;
use crate::session::{Session, SocketId};

/// Bound on the drain-and-exit wait during shutdown.
pub const SENDER_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a session socket, shared between the session owner and
/// the queued send jobs. The socket stays open for writing until the last
/// clone is dropped, so queued packets survive a session teardown.
pub type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Sink for write failures.
pub trait SenderCallback: Send + Sync {
    fn on_send_error(&self, socket_id: SocketId, error: NetError);
}

/// The server-side callback: a failed write is dropped on the floor. A
/// serious transport problem also fails the next read on that socket, and
/// the owning loop closes the session there.
pub struct IgnoreSendErrors;

impl SenderCallback for IgnoreSendErrors {
    fn on_send_error(&self, socket_id: SocketId, error: NetError) {
        tracing::debug!(socket_id = socket_id.0, %error, "Ignoring send error");
    }
}

struct SendJob {
    socket_id: SocketId,
    writer: SharedWriter,
    packet: Packet,
}

/// Cloneable enqueue handle.
#[derive(Clone)]
pub struct Sender {
    queue: mpsc::UnboundedSender<SendJob>,
}

impl Sender {
    /// Enqueues a packet for the session. Never blocks.
    pub fn send(&self, session: &Session, packet: Packet) {
        self.send_raw(session.socket_id(), session.writer(), packet);
    }

    /// Enqueues for a socket known only by its write half.
    pub fn send_raw(&self, socket_id: SocketId, writer: SharedWriter, packet: Packet) {
        // The worker is only gone during shutdown; losing the packet is
        // fine then.
        let _ = self.queue.send(SendJob {
            socket_id,
            writer,
            packet,
        });
    }
}

/// Owner-side handle of the worker task.
pub struct SenderHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SenderHandle {
    /// Flags the worker to drain its queue and exit. Idempotent.
    pub fn signal_termination(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits up to `timeout` for the worker to exit. Returns false if the
    /// worker had to be detached.
    pub async fn join(self, timeout: Duration) -> bool {
        if time::timeout(timeout, self.join).await.is_err() {
            tracing::warn!("Sender worker did not terminate in time, detaching");
            return false;
        }
        true
    }
}

/// Starts the worker and returns the enqueue handle plus the owner handle.
pub fn start(callback: Arc<dyn SenderCallback>) -> (Sender, SenderHandle) {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(run_worker(queue_rx, shutdown_rx, callback));
    (
        Sender { queue: queue_tx },
        SenderHandle {
            shutdown: shutdown_tx,
            join,
        },
    )
}

async fn run_worker(
    mut queue: mpsc::UnboundedReceiver<SendJob>,
    mut shutdown: watch::Receiver<bool>,
    callback: Arc<dyn SenderCallback>,
) {
    loop {
        tokio::select! {
            job = queue.recv() => match job {
                Some(job) => write_job(job, &*callback).await,
                // Every enqueue handle is gone.
                None => break,
            },
            _ = shutdown.changed() => {
                // Flush what is already enqueued, then exit.
                while let Ok(job) = queue.try_recv() {
                    write_job(job, &*callback).await;
                }
                break;
            }
        }
    }
}

async fn write_job(job: SendJob, callback: &dyn SenderCallback) {
    let frame = match encode_packet(&job.packet) {
        Ok(frame) => frame,
        Err(err) => {
            callback.on_send_error(job.socket_id, NetError::Send(err));
            return;
        }
    };
    let mut writer = job.writer.lock().await;
    if let Err(err) = writer.write_all(&frame).await {
        callback.on_send_error(job.socket_id, NetError::Send(err));
    }
}
