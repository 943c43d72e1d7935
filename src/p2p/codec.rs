use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::{crypto::CipherPair, PeerError};
use crate::Bitfield;

// Identifies a block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_idx: usize,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub piece_idx: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

// Applies the negotiated cipher at the framing boundary so message
// parsing never sees ciphertext. The read side keeps a watermark of how
// many buffered bytes are already plaintext: bytes are decrypted exactly
// once on arrival, and the watermark retreats as the decoder consumes
// them. Seeding the watermark covers handshake leftovers that were
// decrypted before framing began.
pub struct CipherChannel {
    pair: CipherPair,
    decrypted: usize,
}

impl CipherChannel {

    pub fn new(pair: CipherPair, plain_prefix: usize) -> Self {
        Self {
            pair,
            decrypted: plain_prefix,
        }
    }

    pub(crate) fn decrypt_new(&mut self, src: &mut BytesMut) {
        if src.len() > self.decrypted {
            let start = self.decrypted;
            self.pair.decrypt(&mut src[start..]);
            self.decrypted = src.len();
        }
    }

    pub(crate) fn mark_consumed(&mut self, n: usize) {
        debug_assert!(n <= self.decrypted);
        self.decrypted -= n;
    }

    pub(crate) fn encrypt_from(&mut self, dst: &mut BytesMut, start: usize) {
        self.pair.encrypt(&mut dst[start..]);
    }
}

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // Advises peers not to close the connection, even if they haven't
    // received a message in some time.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Short form method of communicating which pieces a client has,
    // sent once after the handshake.
    Bitfield(Bitfield),

    // Request for a block: piece index, offset within the piece, length.
    Request(BlockInfo),

    // Block payload, referencing piece index and block offset.
    Block(BlockData),

    // Cancels an outstanding request for a block.
    Cancel(BlockInfo),

    // Listening port for the peer's DHT node.
    Port { port: u32 },

    // Fast extension: a piece the remote thinks we should fetch.
    Suggest { idx: u32 },

    // Fast extension: replaces an all-ones / all-zeroes bitfield.
    HaveAll,
    HaveNone,

    // Fast extension: a request that will not be served.
    Reject(BlockInfo),

    // Fast extension: piece downloadable while choked.
    AllowedFast { idx: u32 },

    // Extension-protocol frame, payload decoded a layer up. Id 0 is the
    // extended handshake.
    Extended { id: u8, payload: Vec<u8> },
}

pub struct MessageCodec {
    channel: Option<CipherChannel>,
}

impl MessageCodec {

    pub fn new(channel: Option<CipherChannel>) -> Self {
        Self { channel }
    }

    pub fn plaintext() -> Self {
        Self { channel: None }
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                // Byte count, not bit count: a trailing partial byte
                // still goes on the wire.
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port as u16);
            },

            // suggest: <len=0005><id=13><piece index>
            Message::Suggest { idx } => {
                dst.put_u32(5);
                dst.put_u8(13);
                dst.put_u32(idx);
            },

            // [0, 0, 0, 1, 14]
            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(14);
            },

            // [0, 0, 0, 1, 15]
            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(15);
            },

            // reject: <len=0013><id=16><index><begin><length>
            Message::Reject(block) => {
                dst.put_u32(13);
                dst.put_u8(16);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // allowed fast: <len=0005><id=17><piece index>
            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(17);
                dst.put_u32(idx);
            },

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            },
        }

        if let Some(channel) = self.channel.as_mut() {
            channel.encrypt_from(dst, start);
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(channel) = self.channel.as_mut() {
            channel.decrypt_new(src);
        }
        let before = src.len();
        let result = decode_plain(src);
        if let Some(channel) = self.channel.as_mut() {
            channel.mark_consumed(before - src.len());
        }
        result
    }
}

fn decode_plain(src: &mut BytesMut) -> Result<Option<Message>, PeerError> {

    // Can't read message length.
    if src.remaining() < 4 {
        return Ok(None);
    }

    let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if src.remaining() < 4 + msg_len {
        // Haven't recieved all of message.
        return Ok(None);
    }
    src.advance(4);
    if msg_len == 0 {
        return Ok(Some(Message::KeepAlive));
    }

    let id = src.get_u8();
    if !frame_len_valid(id, msg_len) {
        tracing::warn!("message id {} with invalid length {}", id, msg_len);
        return Err(PeerError::InvalidMessage);
    }

    let msg = match id {
        0 => Message::Choke,
        1 => Message::Unchoke,
        2 => Message::Interested,
        3 => Message::NotInterested,
        4 => Message::Have { idx: src.get_u32() },
        5 => {
            let mut bitfield = vec![0; msg_len - 1];
            src.copy_to_slice(&mut bitfield);
            Message::Bitfield(Bitfield::from_vec(bitfield))
        },
        6 => {
            let piece_idx = src.get_u32() as usize;
            let offset = src.get_u32() as usize;
            let len = src.get_u32() as usize;
            Message::Request(BlockInfo { piece_idx, offset, len })
        },
        7 => {
            let piece_idx = src.get_u32() as usize;
            let offset = src.get_u32() as usize;
            let mut data = vec![0; msg_len - 9];
            src.copy_to_slice(&mut data);
            Message::Block(BlockData { piece_idx, offset, data })
        },
        8 => {
            let piece_idx = src.get_u32() as usize;
            let offset = src.get_u32() as usize;
            let len = src.get_u32() as usize;
            Message::Cancel(BlockInfo { piece_idx, offset, len })
        },
        9 => Message::Port { port: src.get_u16() as u32 },
        13 => Message::Suggest { idx: src.get_u32() },
        14 => Message::HaveAll,
        15 => Message::HaveNone,
        16 => {
            let piece_idx = src.get_u32() as usize;
            let offset = src.get_u32() as usize;
            let len = src.get_u32() as usize;
            Message::Reject(BlockInfo { piece_idx, offset, len })
        },
        17 => Message::AllowedFast { idx: src.get_u32() },
        20 => {
            let id = src.get_u8();
            let mut payload = vec![0; msg_len - 2];
            src.copy_to_slice(&mut payload);
            Message::Extended { id, payload }
        },
        id => {
            tracing::warn!("invalid message id: {}", id);
            return Err(PeerError::InvalidMessageId(id));
        }
    };

    Ok(Some(msg))
}

// Declared frame lengths the wire format allows per message id. A
// violation is unrecoverable, the framing of everything after it is
// lost. Unknown ids fall through to their own error.
fn frame_len_valid(id: u8, msg_len: usize) -> bool {
    match id {
        0..=3 | 14 | 15 => msg_len == 1,
        4 | 13 | 17 => msg_len == 5,
        5 => msg_len >= 1,
        6 | 8 | 16 => msg_len == 13,
        7 => msg_len >= 9,
        9 => msg_len == 3,
        20 => msg_len >= 2,
        _ => true,
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Suggest { idx } => write!(f, "suggest piece idx: {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::Reject(block) => write!(f, "reject for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::AllowedFast { idx } => write!(f, "allowed fast piece idx: {}", idx),
            Message::Extended { id, payload } => write!(f, "extended {{ id: {}, length: {} }}", id, payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::crypto::{CipherPair, DhKeys, Role};
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Have all
        buf.extend_from_slice(&[0, 0, 0, 1, 14]);
        // Reject
        buf.extend_from_slice(&[0, 0, 0, 0xd, 16, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Allowed fast
        buf.extend_from_slice(&[0, 0, 0, 5, 17, 0, 0, 0, 0xb]);
        // Extended
        buf.extend_from_slice(&[0, 0, 0, 5, 20, 2, 0x64, 0x65, 0x65]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::HaveAll,
            Message::Reject(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::AllowedFast { idx: 0xb },
            Message::Extended { id: 2, payload: vec![0x64, 0x65, 0x65] },
        ];
        let expected_buf = buf.clone();

        let mut codec = MessageCodec::plaintext();
        for msg in expected.into_iter() {
            codec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();
        let mut codec = MessageCodec::plaintext();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[0x2, 0x3]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }));
    }

    // A piece count that is not a multiple of eight leaves a partial
    // trailing byte; the declared length must cover it or the remote's
    // framing desyncs.
    #[test]
    fn test_bitfield_encode_partial_byte() {
        let mut bf = crate::Bitfield::repeat(false, 9);
        bf.set(8, true);

        let mut codec = MessageCodec::plaintext();
        let mut buf = BytesMut::new();
        codec.encode(Message::Bitfield(bf.clone()), &mut buf).unwrap();

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(declared, 1 + bf.as_raw_slice().len());
        assert_eq!(buf.len(), 4 + declared);

        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => assert!(decoded[8]),
            other => panic!("expected bitfield, got {}", other),
        }
        assert!(buf.is_empty());
    }

    // Lying frame lengths are a fatal protocol violation, not a panic.
    #[test]
    fn test_malformed_frame_lengths_rejected() {
        // A have frame without its four index bytes.
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 4][..]);
        let mut codec = MessageCodec::plaintext();
        assert!(matches!(codec.decode(&mut src), Err(PeerError::InvalidMessage)));

        // A piece frame shorter than its fixed header.
        let mut src = BytesMut::from(&[0u8, 0, 0, 5, 7, 0, 0, 0, 1][..]);
        let mut codec = MessageCodec::plaintext();
        assert!(matches!(codec.decode(&mut src), Err(PeerError::InvalidMessage)));

        // An extended frame with no inner id.
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 20][..]);
        let mut codec = MessageCodec::plaintext();
        assert!(matches!(codec.decode(&mut src), Err(PeerError::InvalidMessage)));

        // An oversized choke.
        let mut src = BytesMut::from(&[0u8, 0, 0, 3, 0, 0, 0][..]);
        let mut codec = MessageCodec::plaintext();
        assert!(matches!(codec.decode(&mut src), Err(PeerError::InvalidMessage)));
    }

    #[test]
    fn test_port_round_trip() {
        let mut codec = MessageCodec::plaintext();
        let mut buf = BytesMut::new();
        codec.encode(Message::Port { port: 51413 }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 9, 0xc8, 0xd5]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Port { port: 51413 }
        );
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        let mut codec = MessageCodec::plaintext();
        match codec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected invalid id error, got {:?}", other),
        }
    }

    fn cipher_pair() -> (CipherPair, CipherPair) {
        let a = DhKeys::generate();
        let b = DhKeys::generate();
        let secret = a.shared_secret(&b.public_bytes());
        let info_hash = [5u8; 20];
        (
            CipherPair::new(&secret, &info_hash, Role::Initiator),
            CipherPair::new(&secret, &info_hash, Role::Responder),
        )
    }

    // Messages survive the cipher boundary even when the ciphertext
    // arrives in arbitrary fragments, exercising the decrypt watermark.
    #[test]
    fn test_encrypted_channel_chunked() {
        let (send, recv) = cipher_pair();
        let mut sender = MessageCodec::new(Some(CipherChannel::new(send, 0)));
        let mut receiver = MessageCodec::new(Some(CipherChannel::new(recv, 0)));

        let mut wire = BytesMut::new();
        sender.encode(Message::Have { idx: 7 }, &mut wire).unwrap();
        sender
            .encode(Message::Block(BlockData { piece_idx: 1, offset: 0x4000, data: vec![9; 64] }), &mut wire)
            .unwrap();

        let mut read_buf = BytesMut::new();
        let mut decoded = Vec::new();
        while !wire.is_empty() {
            let take = 3.min(wire.len());
            read_buf.extend_from_slice(&wire.split_to(take));
            while let Some(msg) = receiver.decode(&mut read_buf).unwrap() {
                decoded.push(msg);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], Message::Have { idx: 7 });
        assert_eq!(
            decoded[1],
            Message::Block(BlockData { piece_idx: 1, offset: 0x4000, data: vec![9; 64] })
        );
    }

    // A watermark seeded with a plaintext prefix leaves those bytes alone.
    #[test]
    fn test_plain_prefix_not_double_decrypted() {
        let (send, recv) = cipher_pair();
        let mut sender = MessageCodec::new(Some(CipherChannel::new(send, 0)));

        let mut plain = BytesMut::new();
        MessageCodec::plaintext().encode(Message::Unchoke, &mut plain).unwrap();
        let prefix_len = plain.len();

        let mut wire = BytesMut::new();
        sender.encode(Message::Have { idx: 3 }, &mut wire).unwrap();

        let mut read_buf = plain;
        read_buf.unsplit(wire);

        let mut receiver = MessageCodec::new(Some(CipherChannel::new(recv, prefix_len)));
        assert_eq!(receiver.decode(&mut read_buf).unwrap().unwrap(), Message::Unchoke);
        assert_eq!(receiver.decode(&mut read_buf).unwrap().unwrap(), Message::Have { idx: 3 });
    }
}
