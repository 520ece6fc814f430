//! Typed errors of the transport layer. Each variant has a stable numeric
//! id so GUI callbacks can report failures without string matching, plus
//! the OS error code where one exists.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed the connection (clean EOF or mid-frame).
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Reading from a socket failed.
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    /// Writing to a socket failed.
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    /// A frame arrived that is not a valid packet, or exceeds the size cap.
    #[error("packet decode failed: {0}")]
    Decode(#[source] io::Error),
    /// The listening socket could not be set up.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

impl NetError {
    /// Stable id reported through the server callback.
    pub fn error_id(&self) -> u16 {
        match self {
            NetError::ConnectionClosed => 1,
            NetError::Recv(_) => 2,
            NetError::Send(_) => 3,
            NetError::Decode(_) => 4,
            NetError::Bind(_) => 5,
            NetError::Accept(_) => 6,
        }
    }

    /// Raw OS error code, 0 when the failure has none.
    pub fn os_error_code(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => 0,
            NetError::Recv(err)
            | NetError::Send(err)
            | NetError::Decode(err)
            | NetError::Bind(err)
            | NetError::Accept(err) => err.raw_os_error().unwrap_or(0),
        }
    }

    /// Classify an I/O failure of the read path.
    pub fn from_recv(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            io::ErrorKind::InvalidData => NetError::Decode(err),
            _ => NetError::Recv(err),
        }
    }
}
