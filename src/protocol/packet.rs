use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a command packet (sequence 0): command byte followed by its argument
    pub fn command(command: Command, argument: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + argument.len());
        payload.put_u8(command as u8);
        payload.extend_from_slice(argument);
        Self::new(0, payload.freeze())
    }

    /// Encode packet to bytes (header + payload)
    ///
    /// Payloads of `MAX_PACKET_SIZE` bytes or more go out as consecutive
    /// frames with increasing sequence IDs. A payload that fills its last
    /// frame exactly is terminated by an empty frame.
    pub fn encode(&self, dst: &mut BytesMut) {
        let frames = self.payload.len() / MAX_PACKET_SIZE + 1;
        dst.reserve(self.payload.len() + frames * PACKET_HEADER_SIZE);

        let mut sequence_id = self.sequence_id;
        let mut rest = &self.payload[..];
        loop {
            let len = rest.len().min(MAX_PACKET_SIZE);
            // 3 bytes for length (little endian)
            dst.put_uint_le(len as u64, 3);
            dst.put_u8(sequence_id);
            dst.extend_from_slice(&rest[..len]);
            rest = &rest[len..];
            if len < MAX_PACKET_SIZE {
                break;
            }
            sequence_id = sequence_id.wrapping_add(1);
        }
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// MySQL capability flags used by the client side of the handshake
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested from backends
    ///
    /// CLIENT_DEPRECATE_EOF stays off: result set parsing expects the classic
    /// EOF packet after column definitions.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// MySQL commands issued by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    ResetConnection = 0x1f,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_header() {
        let packet = Packet::new(3, vec![0x0e]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(&buf[..4], &[1, 0, 0, 3]);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], &[0x0e]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_payload_is_split() {
        let packet = Packet::new(0, vec![7u8; MAX_PACKET_SIZE + 10]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(buf.len(), MAX_PACKET_SIZE + 10 + 2 * PACKET_HEADER_SIZE);

        let first = Packet::decode(&mut buf).unwrap();
        assert_eq!(first.sequence_id, 0);
        assert_eq!(first.payload.len(), MAX_PACKET_SIZE);
        let second = Packet::decode(&mut buf).unwrap();
        assert_eq!(second.sequence_id, 1);
        assert_eq!(&second.payload[..], &[7u8; 10]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_full_frame_is_terminated_by_empty_frame() {
        let packet = Packet::new(4, vec![1u8; MAX_PACKET_SIZE]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        assert_eq!(&buf[..4], &[0xFF, 0xFF, 0xFF, 4]);
        let first = Packet::decode(&mut buf).unwrap();
        assert_eq!(first.payload.len(), MAX_PACKET_SIZE);
        assert_eq!(&buf[..], &[0, 0, 0, 5]);
    }

    #[test]
    fn test_decode_waits_for_full_payload() {
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(Packet::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&[3, 4, 5]);
        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_command_packet() {
        let packet = Packet::command(Command::Query, b"SELECT 1");
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(packet.payload[0], 0x03);
        assert_eq!(&packet.payload[1..], b"SELECT 1");
    }
}
