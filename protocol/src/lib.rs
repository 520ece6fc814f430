//! The wire format shared between the lobby server and its clients.
//! Contains the tagged packet type, the constants both sides have to agree
//! on and the framing codec.

pub mod codec;
pub mod packet;

pub use codec::{
    MAX_PACKET_SIZE, decode_packet, encode_packet, read_frame, read_packet, write_packet,
};
pub use packet::*;

/// Major protocol version. Checked by the server during the Init handshake,
/// a mismatch terminates the session.
pub const NET_VERSION_MAJOR: u16 = 3;

/// Minor protocol version. Transmitted for diagnostics, never checked.
pub const NET_VERSION_MINOR: u16 = 0;

/// Maximum length of a player name in bytes.
pub const MAX_NAME_SIZE: usize = 64;

/// Name prefix reserved for server-created AI participants. Handshakes with
/// a name starting like this are rejected.
pub const AI_NAME_PREFIX: &str = "Computer";
