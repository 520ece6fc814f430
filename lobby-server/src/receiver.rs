//! Stateless framed-packet reads with a bounded timeout.

use std::time::Duration;

use tokio::time;

use protocol::Packet;

use crate::error::NetError;
use crate::session::Session;

/// How long one select or receive step may block its owning loop.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(20);

/// Reads one packet from the session.
///
/// `Ok(None)` when the timeout expires without a complete frame. Transport
/// and decode failures come back as a typed [`NetError`]; the caller is
/// expected to tear the session down.
pub async fn recv_packet(session: &mut Session, timeout: Duration) -> Result<Option<Packet>, NetError> {
    match time::timeout(timeout, protocol::read_packet(session.reader_mut())).await {
        Err(_) => Ok(None),
        Ok(Ok(packet)) => Ok(Some(packet)),
        Ok(Err(err)) => Err(NetError::from_recv(err)),
    }
}
