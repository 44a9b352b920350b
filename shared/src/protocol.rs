//! Framed binary packet codec.
//!
//! Frames are `header || payload`. The header is a fixed 16-byte record:
//!
//! | offset | size | field            | notes                                |
//! |--------|------|------------------|--------------------------------------|
//! | 0      | 1    | `type`           | packet type code                     |
//! | 1      | 1    | `id`             | client-local invitation id           |
//! | 2      | 1    | `role`           | game role / winner code              |
//! | 3      | 1    | reserved         | written as zero, ignored on receive  |
//! | 4      | 2    | `size`           | payload length, network byte order   |
//! | 6      | 4    | `timestamp_sec`  | network byte order                   |
//! | 10     | 4    | `timestamp_nsec` | network byte order                   |
//! | 14     | 2    | reserved         | written as zero, ignored on receive  |
//!
//! The payload is exactly `size` raw bytes with no terminator. In memory all
//! fields are host order; conversion happens only in [`PacketHeader::encode`]
//! and [`PacketHeader::decode`]. Outbound timestamps are stamped from the
//! server's monotonic clock at send time.

use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Errors raised by the packet codec.
///
/// An end-of-stream before the first header byte is *not* an error; it is
/// reported as `Ok(None)` from [`recv_packet`] so service loops can shut
/// down without logging a failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a header or payload.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// A payload was handed to the codec that cannot be described by the
    /// header's u16 size field.
    #[error("payload of {0} bytes exceeds the wire format's 65535-byte limit")]
    PayloadTooLarge(usize),

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Packet type codes.
///
/// The first eight are client requests; the rest are server responses and
/// asynchronous notifications. Code 0 is reserved and invalid on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Log in under a username (payload: username bytes).
    Login = 1,
    /// Request the listing of logged-in players.
    Users = 2,
    /// Invite another player (payload: target username; role: target's role).
    Invite = 3,
    /// Revoke a previously sent invitation (id: local invitation id).
    Revoke = 4,
    /// Decline a received invitation (id: local invitation id).
    Decline = 5,
    /// Accept a received invitation (id: local invitation id).
    Accept = 6,
    /// Make a move in a game (id: local invitation id; payload: move text).
    Move = 7,
    /// Resign a game in progress (id: local invitation id).
    Resign = 8,
    /// Positive response to a request.
    Ack = 9,
    /// Negative response to a request.
    Nack = 10,
    /// You have been invited (id: your local id; payload: inviter's name).
    Invited = 11,
    /// An invitation you received was revoked by its sender.
    Revoked = 12,
    /// An invitation you sent was accepted (payload: initial state if you
    /// move first).
    Accepted = 13,
    /// An invitation you sent was declined.
    Declined = 14,
    /// Your opponent moved (payload: the new rendered state).
    Moved = 15,
    /// Your opponent resigned.
    Resigned = 16,
    /// A game ended (role: winner's role, 0 for a draw).
    Ended = 17,
}

impl PacketType {
    /// The wire code for this packet type.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code, if it names a known packet type.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PacketType::Login),
            2 => Some(PacketType::Users),
            3 => Some(PacketType::Invite),
            4 => Some(PacketType::Revoke),
            5 => Some(PacketType::Decline),
            6 => Some(PacketType::Accept),
            7 => Some(PacketType::Move),
            8 => Some(PacketType::Resign),
            9 => Some(PacketType::Ack),
            10 => Some(PacketType::Nack),
            11 => Some(PacketType::Invited),
            12 => Some(PacketType::Revoked),
            13 => Some(PacketType::Accepted),
            14 => Some(PacketType::Declined),
            15 => Some(PacketType::Moved),
            16 => Some(PacketType::Resigned),
            17 => Some(PacketType::Ended),
            _ => None,
        }
    }
}

/// The fixed-size packet header, with all fields in host byte order.
///
/// The `kind` field is kept as the raw wire byte rather than a
/// [`PacketType`] so that a frame with an unrecognized type code can still
/// be received and answered (with a NACK) instead of killing the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet type code.
    pub kind: u8,
    /// Client-local invitation id, or 0 where not meaningful.
    pub id: u8,
    /// Game role byte, or 0 where not meaningful.
    pub role: u8,
    /// Payload length in bytes.
    pub size: u16,
    /// Seconds component of the send timestamp.
    pub timestamp_sec: u32,
    /// Nanoseconds component of the send timestamp.
    pub timestamp_nsec: u32,
}

impl PacketHeader {
    /// Create a header of the given type with all other fields zeroed.
    /// `size` and the timestamp are filled in by [`send_packet`].
    pub fn new(kind: PacketType) -> Self {
        Self {
            kind: kind.code(),
            id: 0,
            role: 0,
            size: 0,
            timestamp_sec: 0,
            timestamp_nsec: 0,
        }
    }

    /// The packet type this header names, if the code is recognized.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_code(self.kind)
    }

    /// Serialize into wire form (multi-byte fields big-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind;
        buf[1] = self.id;
        buf[2] = self.role;
        // buf[3] and buf[14..16] are reserved, left zero
        buf[4..6].copy_from_slice(&self.size.to_be_bytes());
        buf[6..10].copy_from_slice(&self.timestamp_sec.to_be_bytes());
        buf[10..14].copy_from_slice(&self.timestamp_nsec.to_be_bytes());
        buf
    }

    /// Deserialize from wire form.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            kind: buf[0],
            id: buf[1],
            role: buf[2],
            size: u16::from_be_bytes([buf[4], buf[5]]),
            timestamp_sec: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            timestamp_nsec: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        }
    }
}

/// A received packet: header plus payload (empty when `size` was zero).
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Seconds and nanoseconds elapsed on the monotonic clock since the first
/// packet was stamped. Wall-clock jumps never move outbound timestamps.
fn monotonic_timestamp() -> (u32, u32) {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed();
    (elapsed.as_secs() as u32, elapsed.subsec_nanos())
}

/// Send one packet: header first, then the payload iff it is non-empty.
///
/// The header's `size` field is filled from `payload` and its timestamp is
/// stamped here, at send time. Partial writes are fully drained by the
/// underlying `write_all`; a short write or closed peer surfaces as
/// [`ProtocolError::Io`].
pub async fn send_packet<W>(
    writer: &mut W,
    mut header: PacketHeader,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    header.size = payload.len() as u16;
    let (sec, nsec) = monotonic_timestamp();
    header.timestamp_sec = sec;
    header.timestamp_nsec = nsec;

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Receive one packet, blocking until a full frame is available.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte; this is the normal way a service loop learns its client is gone.
/// An EOF anywhere else in the frame is a [`ProtocolError::Truncated`].
pub async fn recv_packet<R>(reader: &mut R) -> Result<Option<Packet>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE,
                got: filled,
            });
        }
        filled += n;
    }

    let header = PacketHeader::decode(&buf);
    let mut payload = vec![0u8; header.size as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::Truncated {
                    expected: header.size as usize,
                    got: 0,
                }
            } else {
                ProtocolError::Io(err)
            }
        })?;
    }
    Ok(Some(Packet { header, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = PacketHeader {
            kind: PacketType::Moved.code(),
            id: 3,
            role: 2,
            size: 0x0102,
            timestamp_sec: 0x0A0B0C0D,
            timestamp_nsec: 0x01020304,
        };
        let buf = header.encode();

        assert_eq!(buf[0], 15);
        assert_eq!(buf[1], 3);
        assert_eq!(buf[2], 2);
        assert_eq!(buf[3], 0); // reserved
        assert_eq!(&buf[4..6], &[0x01, 0x02]);
        assert_eq!(&buf[6..10], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&buf[10..14], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[14..16], &[0, 0]);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            kind: PacketType::Invited.code(),
            id: 7,
            role: 1,
            size: 513,
            timestamp_sec: 42,
            timestamp_nsec: 999_999_999,
        };
        assert_eq!(PacketHeader::decode(&header.encode()), header);
    }

    #[test]
    fn test_packet_type_codes_roundtrip() {
        for code in 1..=17u8 {
            let kind = PacketType::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(PacketType::from_code(0), None);
        assert_eq!(PacketType::from_code(18), None);
        assert_eq!(PacketType::from_code(255), None);
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip_with_payload() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let mut header = PacketHeader::new(PacketType::Login);
        header.id = 0;
        send_packet(&mut a, header, b"alice").await.unwrap();

        let packet = recv_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(packet.header.packet_type(), Some(PacketType::Login));
        assert_eq!(packet.header.size, 5);
        assert_eq!(packet.payload, b"alice");
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip_without_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let mut header = PacketHeader::new(PacketType::Revoke);
        header.id = 4;
        send_packet(&mut a, header, &[]).await.unwrap();

        let packet = recv_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(packet.header.packet_type(), Some(PacketType::Revoke));
        assert_eq!(packet.header.id, 4);
        assert!(packet.payload.is_empty());
    }

    #[tokio::test]
    async fn test_eof_before_header_is_end_of_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let result = recv_packet(&mut b).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_header_is_truncated() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 0, 0, 0, 0]).await.unwrap();
        drop(a);

        match recv_packet(&mut b).await {
            Err(ProtocolError::Truncated { expected, got }) => {
                assert_eq!(expected, HEADER_SIZE);
                assert_eq!(got, 5);
            }
            other => panic!("expected truncated header, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_truncated() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = PacketHeader::new(PacketType::Move);
        header.size = 10;
        a.write_all(&header.encode()).await.unwrap();
        a.write_all(b"5<-").await.unwrap();
        drop(a);

        assert!(matches!(
            recv_packet(&mut b).await,
            Err(ProtocolError::Truncated { expected: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_code_is_received() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let header = PacketHeader {
            kind: 200,
            id: 0,
            role: 0,
            size: 0,
            timestamp_sec: 0,
            timestamp_nsec: 0,
        };
        a.write_all(&header.encode()).await.unwrap();

        let packet = recv_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(packet.header.kind, 200);
        assert_eq!(packet.header.packet_type(), None);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; u16::MAX as usize + 1];
        let result = send_packet(&mut a, PacketHeader::new(PacketType::Moved), &payload).await;
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn test_timestamps_are_nondecreasing() {
        let (mut a, mut b) = tokio::io::duplex(256);

        send_packet(&mut a, PacketHeader::new(PacketType::Ack), &[])
            .await
            .unwrap();
        send_packet(&mut a, PacketHeader::new(PacketType::Ack), &[])
            .await
            .unwrap();

        let first = recv_packet(&mut b).await.unwrap().unwrap().header;
        let second = recv_packet(&mut b).await.unwrap().unwrap().header;
        let t1 = (first.timestamp_sec, first.timestamp_nsec);
        let t2 = (second.timestamp_sec, second.timestamp_nsec);
        assert!(t2 >= t1);
    }
}
