use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::p2p::handshake::EncryptionPolicy;

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: [u8; 20],

    // Directory downloaded files are written into.
    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    // Preference order for the obfuscation handshake.
    pub encryption: EncryptionPolicy,

    // Max outstanding block requests per connection.
    pub pipeline_depth: usize,

    // Must be shorter than the overall connection timeout so a failed
    // negotiation can still fall back to plaintext in time.
    pub handshake_timeout: Duration,

    // No block arrival within this window abandons the in-flight piece.
    pub request_timeout: Duration,

    // Wait for verification + buffered write of a completed piece.
    pub completion_timeout: Duration,

    // Buffered bytes per file before a flush is forced.
    pub flush_threshold: usize,

    // Failed hash checks tolerated before the peer is dropped.
    pub bad_piece_limit: u32,

    pub pex_interval: Duration,

    pub max_peers: usize,

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-PW0010-73b3b0b0b0b0";

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            encryption: EncryptionPolicy::PreferEncrypt,
            pipeline_depth: 4,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            completion_timeout: Duration::from_secs(5),
            flush_threshold: 4 * 1024 * 1024,
            bad_piece_limit: 3,
            pex_interval: Duration::from_secs(60),
            max_peers: 100,
        }
    }
}
