use tokio::sync::mpsc;

mod config;
mod info;
mod torrent;
mod p2p;
mod store;
mod extensions;
pub mod stats;

// Most commonly used block size - 16KB.
const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 info hash / peer id.
pub type ID = [u8; 20];

// Events emitted by a torrent for the orchestration layers
// (tracker announces, DHT, UI) to consume.
pub enum Event {

    // A peer session completed its handshake.
    PeerConnected {
        address: std::net::SocketAddr,
        id: ID,
    },

    PeerDisconnected {
        address: std::net::SocketAddr,
    },

    // A piece was verified and handed to the store.
    PieceCompleted {
        idx: usize,
    },

    // Metadata was reassembled from peers and verified against the info hash.
    MetadataResolved {
        info: Vec<u8>,
    },

    // All pieces are present and flushed.
    TorrentComplete,

    // Sent every second with the current stats of the torrent.
    TorrentStats {
        stats: stats::TorrentStats,
    },

    TorrentError(String),

}

type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

// Re-exports
pub use config::Config;
pub use info::{FileSpan, TorrentInfo};
pub use p2p::handshake::EncryptionPolicy;
pub use p2p::state::{ConnState, SessionState};
pub use store::{StoreError, StoreGroup};
pub use torrent::{Torrent, TorrentError, TorrentHandle, TorrentParams};

// Spawns a torrent task over the given storage layout. File spans, piece
// length and the hash table come from the metadata loader and are treated
// as immutable from here on.
pub fn start_torrent(params: TorrentParams) -> Result<(TorrentHandle, EventRx), TorrentError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = Torrent::spawn(params, event_tx)?;
    Ok((handle, event_rx))
}
