// RC4-class cipher negotiation for the obfuscation handshake.
//
// Two independent stream ciphers are derived once per connection from the
// Diffie-Hellman shared secret and the torrent's info hash, then used for
// every subsequent byte on the wire. Key schedule and constants follow the
// message stream encryption convention: SHA1("keyA"|S|H) for the side
// that initiated, SHA1("keyB"|S|H) for the side that accepted, with the
// first 1024 keystream bytes discarded.

use lazy_static::lazy_static;
use num_bigint::BigUint;
use rand::RngCore;
use rc4::{consts::U20, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use crate::ID;

lazy_static! {
    // 768-bit prime from the message stream encryption spec.
    static ref PRIME: BigUint = BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
          020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
          4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563",
        16,
    ).unwrap();

    static ref GENERATOR: BigUint = BigUint::from(2u32);
}

// Fixed-width encoding of public keys and the shared secret.
pub const PUBKEY_LEN: usize = 96;

// 160-bit private keys.
const PRIVATE_KEY_LEN: usize = 20;

// Keystream bytes discarded after key scheduling.
const DISCARD: usize = 1024;

type Cipher = Rc4<U20>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

pub struct DhKeys {
    private: BigUint,
    public: BigUint,
}

impl DhKeys {

    pub fn generate() -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let private = BigUint::from_bytes_be(&bytes);
        let public = GENERATOR.modpow(&private, &PRIME);
        Self { private, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBKEY_LEN] {
        fixed_width(&self.public)
    }

    // Fixed-width shared secret from the remote public key.
    pub fn shared_secret(&self, remote_public: &[u8]) -> [u8; PUBKEY_LEN] {
        debug_assert_eq!(remote_public.len(), PUBKEY_LEN);
        let remote = BigUint::from_bytes_be(remote_public);
        fixed_width(&remote.modpow(&self.private, &PRIME))
    }
}

fn fixed_width(n: &BigUint) -> [u8; PUBKEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; PUBKEY_LEN];
    out[PUBKEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

pub fn sha1(parts: &[&[u8]]) -> ID {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn keyed_cipher(prefix: &'static [u8], secret: &[u8; PUBKEY_LEN], info_hash: &ID) -> Cipher {
    let key = sha1(&[prefix, secret, info_hash]);
    let mut cipher = Rc4::<U20>::new(key.as_slice().into());
    let mut discard = [0u8; DISCARD];
    cipher.apply_keystream(&mut discard);
    cipher
}

// The two keyed cipher states of one connection. Never shared and never
// reused across connections; dropped with the session.
pub struct CipherPair {
    send: Cipher,
    recv: Cipher,
}

impl CipherPair {

    pub fn new(secret: &[u8; PUBKEY_LEN], info_hash: &ID, role: Role) -> Self {
        let (send_key, recv_key): (&'static [u8], &'static [u8]) = match role {
            Role::Initiator => (b"keyA", b"keyB"),
            Role::Responder => (b"keyB", b"keyA"),
        };
        Self {
            send: keyed_cipher(send_key, secret, info_hash),
            recv: keyed_cipher(recv_key, secret, info_hash),
        }
    }

    // In-place transforms, cursor semantics of the buffer are untouched.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.send.apply_keystream(buf);
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.recv.apply_keystream(buf);
    }

    // Advances the receive keystream past bytes that were consumed raw
    // (the verification-constant marker located by pattern match).
    pub fn skip_recv(&mut self, n: usize) {
        let mut scratch = vec![0u8; n];
        self.recv.apply_keystream(&mut scratch);
    }
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPair").finish_non_exhaustive()
    }
}

// What the remote's first encrypted bytes will look like on the wire.
// Built from a throwaway cipher keyed identically to the receive state
// but never advanced by real traffic.
pub fn recv_pattern(secret: &[u8; PUBKEY_LEN], info_hash: &ID, role: Role, plain: &[u8]) -> Vec<u8> {
    let key: &'static [u8] = match role {
        Role::Initiator => b"keyB",
        Role::Responder => b"keyA",
    };
    let mut throwaway = keyed_cipher(key, secret, info_hash);
    let mut pattern = plain.to_vec();
    throwaway.apply_keystream(&mut pattern);
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchanged_secret() -> ([u8; PUBKEY_LEN], DhKeys, DhKeys) {
        let a = DhKeys::generate();
        let b = DhKeys::generate();
        let s_a = a.shared_secret(&b.public_bytes());
        let s_b = b.shared_secret(&a.public_bytes());
        assert_eq!(s_a, s_b);
        (s_a, a, b)
    }

    #[test]
    fn test_cipher_round_trip() {
        let (secret, _, _) = exchanged_secret();
        let info_hash = [7u8; 20];
        let mut initiator = CipherPair::new(&secret, &info_hash, Role::Initiator);
        let mut responder = CipherPair::new(&secret, &info_hash, Role::Responder);

        let plain = b"interoperability is a virtue".to_vec();

        let mut wire = plain.clone();
        initiator.encrypt(&mut wire);
        assert_ne!(wire, plain);
        responder.decrypt(&mut wire);
        assert_eq!(wire, plain);

        // And the reverse direction, chunked to check stream continuity.
        let mut wire = plain.clone();
        responder.encrypt(&mut wire);
        let (head, tail) = wire.split_at_mut(5);
        initiator.decrypt(head);
        initiator.decrypt(tail);
        assert_eq!(wire, plain);
    }

    #[test]
    fn test_recv_pattern_matches_remote_send() {
        let (secret, _, _) = exchanged_secret();
        let info_hash = [1u8; 20];
        let mut responder = CipherPair::new(&secret, &info_hash, Role::Responder);

        let vc = [0u8; 8];
        let mut sent = vc;
        responder.encrypt(&mut sent);

        let expected = recv_pattern(&secret, &info_hash, Role::Initiator, &vc);
        assert_eq!(sent.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_public_key_fixed_width() {
        let keys = DhKeys::generate();
        assert_eq!(keys.public_bytes().len(), PUBKEY_LEN);
    }
}
