use bytes::{Buf, BufMut, BytesMut};
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use super::{
    codec::CipherChannel,
    crypto::{self, CipherPair, DhKeys, Role, PUBKEY_LEN},
    scan::{PadReader, ScanOutcome, StreamScanner},
    PeerError, Result,
};
use crate::ID;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Length-prefixed protocol string, the first bytes of every plaintext
// connection.
const PREAMBLE: [u8; 20] = *b"\x13BitTorrent protocol";

// Verification constant, eight zero bytes sent through a fresh cipher so
// the receiver can locate the start of ciphertext amid random padding.
const VC: [u8; 8] = [0; 8];

const CRYPT_PLAIN: u32 = 0x01;
const CRYPT_RC4: u32 = 0x02;

// Random padding per message is capped at this.
const PAD_MAX: usize = 512;

// How deep into the remote's stream each marker may legally end:
// pubkey + pad + the marker itself.
const VC_SEARCH_LIMIT: usize = PUBKEY_LEN + PAD_MAX + VC.len();
const REQ1_SEARCH_LIMIT: usize = PUBKEY_LEN + PAD_MAX + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    PlaintextOnly,
    PreferPlaintext,
    PreferEncrypt,
    EncryptOnly,
}

impl EncryptionPolicy {

    // Bitmap offered to the remote when initiating.
    fn provide(&self) -> u32 {
        match self {
            EncryptionPolicy::PlaintextOnly => CRYPT_PLAIN,
            EncryptionPolicy::EncryptOnly => CRYPT_RC4,
            _ => CRYPT_PLAIN | CRYPT_RC4,
        }
    }

    // Responder's choice among the bits the remote offered. None means
    // no mutually supported method.
    fn select(&self, provided: u32) -> Option<u32> {
        let plain = provided & CRYPT_PLAIN != 0;
        let rc4 = provided & CRYPT_RC4 != 0;
        match self {
            EncryptionPolicy::PlaintextOnly => plain.then_some(CRYPT_PLAIN),
            EncryptionPolicy::PreferPlaintext if plain => Some(CRYPT_PLAIN),
            EncryptionPolicy::PreferEncrypt if rc4 => Some(CRYPT_RC4),
            _ if rc4 => Some(CRYPT_RC4),
            _ if plain => Some(CRYPT_PLAIN),
            _ => None,
        }
    }
}

// Outcome of the negotiation. `leftover` holds bytes that arrived past
// the handshake and belong to the message stream; the first
// `plain_prefix` of them have already been decrypted (or were plaintext
// to begin with) and must not be run through the cipher again.
pub struct Crypto {
    pub cipher: Option<CipherPair>,
    pub leftover: BytesMut,
    pub plain_prefix: usize,
}

impl Crypto {

    pub fn encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn plaintext(leftover: BytesMut) -> Self {
        let plain_prefix = leftover.len();
        Self {
            cipher: None,
            leftover,
            plain_prefix,
        }
    }
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypto")
            .field("encrypted", &self.encrypted())
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

fn random_pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut pad = vec![0u8; rng.gen_range(0..=PAD_MAX)];
    rng.fill_bytes(&mut pad);
    pad
}

// Reads until at least `min` bytes are buffered.
async fn fill<S>(stream: &mut S, buf: &mut BytesMut, min: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < min {
        if stream.read_buf(buf).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
    Ok(())
}

// Takes exactly `n` bytes off the front of the stream, decrypting just
// those so later bytes stay raw for whoever consumes them next.
async fn take_decrypted<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    cipher: &mut CipherPair,
    n: usize,
) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    fill(stream, buf, n).await?;
    cipher.decrypt(&mut buf[..n]);
    Ok(buf.split_to(n))
}

// Reads one encrypted `(u16 length, length bytes)` sequence, rejecting
// declared lengths above `max`. Used for both pad fields and the
// initial-payload prefix, which share the shape.
async fn read_len_prefixed<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    cipher: &mut CipherPair,
    max: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = PadReader::new();
    let mut staged = BytesMut::new();
    loop {
        let chunk = take_decrypted(stream, buf, cipher, reader.needed()).await?;
        staged.unsplit(chunk);
        let done = reader.read_from(&mut staged);
        if reader.declared().map(|len| len > max).unwrap_or(false) {
            // The cipher can't resync past a lying length, so there is
            // no downgrade from here.
            return Err(PeerError::InvalidMessage);
        }
        if let Some(bytes) = done {
            return Ok(bytes);
        }
    }
}

// Drives the obfuscation negotiation for a connection we dialed. The
// torrent is known up front so both cipher states derive immediately
// after the key exchange. Soft failures (scan limits, an unreadable
// confirm) downgrade to a plaintext outcome rather than erroring, the
// caller decides whether that is acceptable.
pub async fn establish_outbound<S>(
    stream: &mut S,
    info_hash: &ID,
    policy: EncryptionPolicy,
) -> Result<Crypto>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if policy == EncryptionPolicy::PlaintextOnly {
        return Ok(Crypto::plaintext(BytesMut::new()));
    }

    let keys = DhKeys::generate();
    let mut out = BytesMut::new();
    out.extend_from_slice(&keys.public_bytes());
    out.extend_from_slice(&random_pad());
    stream.write_all(&out).await?;

    let mut buf = BytesMut::with_capacity(PUBKEY_LEN + PAD_MAX);
    fill(stream, &mut buf, PUBKEY_LEN).await?;
    let secret = keys.shared_secret(&buf.split_to(PUBKEY_LEN));
    let mut cipher = CipherPair::new(&secret, info_hash, Role::Initiator);

    // req1 marker, the xor'd torrent selector, then everything onwards
    // under the cipher. No initial payload is carried.
    let mut provide = BytesMut::new();
    provide.extend_from_slice(&crypto::sha1(&[b"req1", &secret]));
    let req2 = crypto::sha1(&[b"req2", info_hash]);
    let req3 = crypto::sha1(&[b"req3", &secret]);
    provide.extend_from_slice(
        &req2.iter().zip(req3.iter()).map(|(a, b)| a ^ b).collect::<Vec<u8>>(),
    );
    let pad_c = random_pad();
    let mut tail = BytesMut::new();
    tail.extend_from_slice(&VC);
    tail.put_u32(policy.provide());
    tail.put_u16(pad_c.len() as u16);
    tail.extend_from_slice(&pad_c);
    tail.put_u16(0);
    cipher.encrypt(&mut tail);
    provide.extend_from_slice(&tail);
    stream.write_all(&provide).await?;

    // The remote's pad precedes its first ciphertext, so hunt for what
    // the verification constant looks like under its send key.
    let pattern = crypto::recv_pattern(&secret, info_hash, Role::Initiator, &VC);
    let mut scanner = StreamScanner::new(pattern, VC_SEARCH_LIMIT - PUBKEY_LEN);
    loop {
        match scanner.scan(&buf) {
            ScanOutcome::Found(end) => {
                buf.advance(end);
                cipher.skip_recv(VC.len());
                break;
            }
            ScanOutcome::NotYet => {
                let min = buf.len() + 1;
                fill(stream, &mut buf, min).await?;
            }
            ScanOutcome::LimitExceeded => {
                tracing::debug!("no verification constant in window, downgrading");
                if policy == EncryptionPolicy::EncryptOnly {
                    return Err(PeerError::EncryptionRequired);
                }
                return Ok(Crypto::plaintext(buf));
            }
        }
    }

    let head = take_decrypted(stream, &mut buf, &mut cipher, 4).await?;
    let selected = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    read_len_prefixed(stream, &mut buf, &mut cipher, PAD_MAX).await?;

    match selected {
        CRYPT_RC4 => {
            tracing::debug!("negotiated rc4");
            Ok(Crypto {
                cipher: Some(cipher),
                leftover: buf,
                plain_prefix: 0,
            })
        }
        CRYPT_PLAIN if policy != EncryptionPolicy::EncryptOnly => {
            tracing::debug!("negotiated plaintext");
            Ok(Crypto::plaintext(buf))
        }
        CRYPT_PLAIN => Err(PeerError::EncryptionRequired),
        _ if policy == EncryptionPolicy::EncryptOnly => Err(PeerError::EncryptionRequired),
        _ => {
            tracing::debug!(selected, "bad selection, downgrading");
            Ok(Crypto::plaintext(buf))
        }
    }
}

// Drives the negotiation for an accepted connection. The torrent is not
// known yet, it is recovered by matching the remote's xor'd selector
// against every hash we serve. Returns the discovered info hash, or None
// when the remote spoke the plaintext protocol from the first byte.
pub async fn establish_inbound<S>(
    stream: &mut S,
    torrents: &[ID],
    policy: EncryptionPolicy,
) -> Result<(Crypto, Option<ID>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(PUBKEY_LEN + PAD_MAX);
    fill(stream, &mut buf, PREAMBLE.len()).await?;

    // Legacy peers open with the protocol preamble in the clear. Hand
    // the bytes on untouched.
    if buf[..PREAMBLE.len()] == PREAMBLE {
        if policy == EncryptionPolicy::EncryptOnly {
            return Err(PeerError::EncryptionRequired);
        }
        return Ok((Crypto::plaintext(buf), None));
    }

    let keys = DhKeys::generate();
    let mut out = BytesMut::new();
    out.extend_from_slice(&keys.public_bytes());
    out.extend_from_slice(&random_pad());
    stream.write_all(&out).await?;

    fill(stream, &mut buf, PUBKEY_LEN).await?;
    let secret = keys.shared_secret(&buf.split_to(PUBKEY_LEN));

    let req1 = crypto::sha1(&[b"req1", &secret]);
    let mut scanner = StreamScanner::new(req1.to_vec(), REQ1_SEARCH_LIMIT - PUBKEY_LEN);
    loop {
        match scanner.scan(&buf) {
            ScanOutcome::Found(end) => {
                buf.advance(end);
                break;
            }
            ScanOutcome::NotYet => {
                let min = buf.len() + 1;
                fill(stream, &mut buf, min).await?;
            }
            ScanOutcome::LimitExceeded => {
                tracing::debug!("no req1 marker in window, downgrading");
                if policy == EncryptionPolicy::EncryptOnly {
                    return Err(PeerError::EncryptionRequired);
                }
                return Ok((Crypto::plaintext(buf), None));
            }
        }
    }

    fill(stream, &mut buf, 20).await?;
    let selector = buf.split_to(20);
    let req3 = crypto::sha1(&[b"req3", &secret]);
    let info_hash = torrents.iter().copied().find(|hash| {
        let req2 = crypto::sha1(&[b"req2", hash]);
        req2.iter()
            .zip(req3.iter())
            .map(|(a, b)| a ^ b)
            .eq(selector.iter().copied())
    });
    let info_hash = match info_hash {
        Some(hash) => hash,
        None => {
            tracing::debug!("selector matches no torrent we serve, downgrading");
            return Ok((Crypto::plaintext(buf), None));
        }
    };

    let mut cipher = CipherPair::new(&secret, &info_hash, Role::Responder);

    // VC then the provide bitmap.
    let head = take_decrypted(stream, &mut buf, &mut cipher, 12).await?;
    if head[..VC.len()] != VC {
        tracing::debug!("verification constant mismatch, downgrading");
        if policy == EncryptionPolicy::EncryptOnly {
            return Err(PeerError::EncryptionRequired);
        }
        return Ok((Crypto::plaintext(buf), None));
    }
    let provided = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    read_len_prefixed(stream, &mut buf, &mut cipher, PAD_MAX).await?;

    // Initial payload, typically the remote's plaintext-protocol
    // handshake riding inside the encrypted stream. Unlike the pads its
    // length is only bounded by the prefix field itself.
    let initial = read_len_prefixed(stream, &mut buf, &mut cipher, u16::MAX as usize).await?;

    let selected = match policy.select(provided) {
        Some(selected) => selected,
        None => return Err(PeerError::EncryptionRequired),
    };

    let pad_d = random_pad();
    let mut confirm = BytesMut::new();
    confirm.extend_from_slice(&VC);
    confirm.put_u32(selected);
    confirm.put_u16(pad_d.len() as u16);
    confirm.extend_from_slice(&pad_d);
    cipher.encrypt(&mut confirm);
    stream.write_all(&confirm).await?;

    // The initial payload is already decrypted; anything after it in the
    // buffer is raw and owned by the selected method.
    let plain_prefix = initial.len();
    let mut leftover = BytesMut::from(initial.as_slice());
    leftover.unsplit(buf);

    let crypto = if selected == CRYPT_RC4 {
        tracing::debug!("negotiated rc4");
        Crypto {
            cipher: Some(cipher),
            leftover,
            plain_prefix,
        }
    } else {
        tracing::debug!("negotiated plaintext");
        Crypto::plaintext(leftover)
    };
    Ok((crypto, Some(info_hash)))
}

// Reserved-bit flags advertised in the base handshake.
const EXTENDED_FLAG: u8 = 0x10; // byte 5
const FAST_FLAG: u8 = 0x04; // byte 7

pub struct Handshake {
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: ID,
    pub peer_id: ID,
}

impl Handshake {

    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        let mut reserved = [0; 8];
        reserved[5] |= EXTENDED_FLAG;
        reserved[7] |= FAST_FLAG;
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & EXTENDED_FLAG != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_FLAG != 0
    }
}

// Frames the plaintext-protocol handshake, transparently running the
// negotiated cipher when there is one. The channel transfers to the
// message codec afterwards so keystream position carries over.
pub struct HandshakeCodec {
    channel: Option<CipherChannel>,
}

impl HandshakeCodec {

    pub fn new(channel: Option<CipherChannel>) -> Self {
        Self { channel }
    }

    pub fn plaintext() -> Self {
        Self { channel: None }
    }

    pub fn into_channel(self) -> Option<CipherChannel> {
        self.channel
    }
}

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        if let Some(channel) = self.channel.as_mut() {
            channel.encrypt_from(dst, start);
        }
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if let Some(channel) = self.channel.as_mut() {
            channel.decrypt_new(src);
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.len() < 68 {
            return Ok(None);
        }
        src.advance(1);
        if let Some(channel) = self.channel.as_mut() {
            channel.mark_consumed(68);
        }

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_selection() {
        let both = CRYPT_PLAIN | CRYPT_RC4;
        assert_eq!(EncryptionPolicy::PreferEncrypt.select(both), Some(CRYPT_RC4));
        assert_eq!(EncryptionPolicy::PreferPlaintext.select(both), Some(CRYPT_PLAIN));
        assert_eq!(EncryptionPolicy::PreferEncrypt.select(CRYPT_PLAIN), Some(CRYPT_PLAIN));
        assert_eq!(EncryptionPolicy::EncryptOnly.select(CRYPT_PLAIN), None);
        assert_eq!(EncryptionPolicy::PlaintextOnly.select(CRYPT_RC4), None);
    }

    #[tokio::test]
    async fn test_negotiation_both_prefer_encryption() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let info_hash = [9u8; 20];

        let responder = tokio::spawn(async move {
            establish_inbound(
                &mut listener,
                &[[2u8; 20], info_hash],
                EncryptionPolicy::PreferEncrypt,
            )
            .await
        });

        let mut outbound =
            establish_outbound(&mut dialer, &info_hash, EncryptionPolicy::PreferEncrypt)
                .await
                .unwrap();
        let (mut inbound, discovered) = responder.await.unwrap().unwrap();

        assert!(outbound.encrypted());
        assert!(inbound.encrypted());
        assert_eq!(discovered, Some(info_hash));
        assert!(outbound.leftover.is_empty());
        assert!(inbound.leftover.is_empty());

        // Post-handshake traffic rides the negotiated cipher states.
        let mut wire = b"first message".to_vec();
        outbound.cipher.as_mut().unwrap().encrypt(&mut wire);
        inbound.cipher.as_mut().unwrap().decrypt(&mut wire);
        assert_eq!(wire, b"first message");
    }

    #[tokio::test]
    async fn test_plaintext_preamble_bypass() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);

        let handshake = {
            let mut codec = HandshakeCodec::plaintext();
            let mut bytes = BytesMut::new();
            codec
                .encode(Handshake::new([3u8; 20], [4u8; 20]), &mut bytes)
                .unwrap();
            bytes
        };
        dialer.write_all(&handshake).await.unwrap();

        let (crypto, discovered) =
            establish_inbound(&mut listener, &[[3u8; 20]], EncryptionPolicy::PreferEncrypt)
                .await
                .unwrap();

        // Bytes pass through untouched, torrent identified later by the
        // plaintext handshake itself.
        assert!(!crypto.encrypted());
        assert_eq!(discovered, None);
        assert_eq!(&crypto.leftover[..], &handshake[..]);
        assert_eq!(crypto.plain_prefix, crypto.leftover.len());
    }

    #[tokio::test]
    async fn test_encrypt_only_rejects_plaintext_peer() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        dialer.write_all(&PREAMBLE).await.unwrap();

        let err = establish_inbound(&mut listener, &[[3u8; 20]], EncryptionPolicy::EncryptOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::EncryptionRequired));
    }

    // A pad field claiming more than the protocol allows is hostile or
    // corrupt; either way the stream is unrecoverable.
    #[tokio::test]
    async fn test_oversized_pad_rejected() {
        let (mut dialer, mut listener) = tokio::io::duplex(4096);
        let a = DhKeys::generate();
        let b = DhKeys::generate();
        let secret = a.shared_secret(&b.public_bytes());
        let info_hash = [1u8; 20];
        let mut send = CipherPair::new(&secret, &info_hash, Role::Initiator);
        let mut recv = CipherPair::new(&secret, &info_hash, Role::Responder);

        let mut wire = BytesMut::new();
        wire.put_u16((PAD_MAX + 1) as u16);
        wire.extend_from_slice(&vec![0u8; PAD_MAX + 1]);
        send.encrypt(&mut wire);
        dialer.write_all(&wire).await.unwrap();

        let mut buf = BytesMut::new();
        let err = read_len_prefixed(&mut listener, &mut buf, &mut recv, PAD_MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessage));
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&[1; 20]);
        src.extend_from_slice(&[2; 20]);

        let mut decoder = HandshakeCodec::plaintext();
        let handshake = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(handshake.peer_id, [2; 20]);
        assert!(!handshake.supports_extended());
    }

    #[test]
    fn test_handshake_reserved_bits() {
        let handshake = Handshake::new([0; 20], [0; 20]);
        assert!(handshake.supports_extended());
        assert!(handshake.supports_fast());
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let mut decoder = HandshakeCodec::plaintext();
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol....");
        src.extend_from_slice(&[0; 48]);
        let mut decoder = HandshakeCodec::plaintext();
        assert!(decoder.decode(&mut src).is_err());
    }
}
