//! Length-delimited packet framing over TCP.
//!
//! A frame is a 4-byte big-endian length prefix followed by the postcard
//! encoding of one [`Packet`]. The [`MAX_PACKET_SIZE`] cap protects against
//! unbounded allocation from malformed or malicious length prefixes.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::packet::Packet;

/// Maximum allowed packet body size. Lobby packets are tiny; the opaque
/// game configuration payload is the only part that can grow, and 16 KB is
/// generous headroom for it.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024;

/// Encode a packet into a complete wire frame (prefix included).
pub fn encode_packet(packet: &Packet) -> io::Result<Bytes> {
    let body = postcard::to_stdvec(packet)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if body.len() > MAX_PACKET_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet too large: {} bytes (max {MAX_PACKET_SIZE})", body.len()),
        ));
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode a packet from a frame body (prefix already stripped).
pub fn decode_packet(body: &[u8]) -> io::Result<Packet> {
    postcard::from_bytes(body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Read one frame body.
///
/// Returns `UnexpectedEof` if the stream closes before or inside a frame,
/// `InvalidData` if the length prefix exceeds [`MAX_PACKET_SIZE`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {MAX_PACKET_SIZE})"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read and decode one packet.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Packet> {
    let body = read_frame(reader).await?;
    decode_packet(&body)
}

/// Encode and write one packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let frame = encode_packet(packet)?;
    writer.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ErrorCode, ErrorData, InitData};
    use crate::{NET_VERSION_MAJOR, NET_VERSION_MINOR};
    use std::io::Cursor;

    fn init_packet() -> Packet {
        Packet::Init(InitData {
            version_major: NET_VERSION_MAJOR,
            version_minor: NET_VERSION_MINOR,
            password: "secret".into(),
            player_name: "Alice".into(),
        })
    }

    #[tokio::test]
    async fn roundtrip_single_packet() {
        let original = init_packet();
        let frame = encode_packet(&original).unwrap();

        let mut cursor = Cursor::new(frame.to_vec());
        let recovered = read_packet(&mut cursor).await.unwrap();
        assert_eq!(recovered, original);
    }

    #[tokio::test]
    async fn multiple_packets_in_sequence() {
        let packets = vec![
            init_packet(),
            Packet::Error(ErrorData {
                error_code: ErrorCode::ServerFull,
            }),
        ];
        let mut buf = Vec::new();
        for packet in &packets {
            buf.extend_from_slice(&encode_packet(packet).unwrap());
        }

        let mut cursor = Cursor::new(buf);
        for expected in &packets {
            let recovered = read_packet(&mut cursor).await.unwrap();
            assert_eq!(recovered, *expected);
        }
    }

    #[tokio::test]
    async fn rejects_oversized_length_prefix() {
        let fake_len = (MAX_PACKET_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_eof() {
        let frame = encode_packet(&init_packet()).unwrap();
        // Cut the frame short in the middle of the body.
        let mut cursor = Cursor::new(frame[..frame.len() - 3].to_vec());
        let err = read_packet(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn garbage_body_fails_decode() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xff, 0xfe, 0xfd, 0xfc]);
        let mut cursor = Cursor::new(buf);
        let err = read_packet(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
