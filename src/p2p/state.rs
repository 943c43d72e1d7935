use crate::stats::{PeerScore, ScoreSample, ThroughputStats};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    // Whether the connection ended up under the negotiated cipher.
    pub encrypted: bool,

    // Whether the peer declared itself a seed in its extended handshake.
    pub upload_only: bool,

    // Whether the peer declared the holepunch sub-protocol.
    pub holepunch: bool,

    pub throughput: ThroughputStats,

    pub score: PeerScore,

    // Bytes moved since the previous state report, None during the
    // post-connect grace period.
    pub last_sample: Option<ScoreSample>,

    // Pieces the peer has.
    pub num_pieces: usize,

    // Hash failures attributed to this peer.
    pub bad_pieces: u32,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            encrypted: false,
            upload_only: false,
            holepunch: false,
            throughput: ThroughputStats::default(),
            score: PeerScore::default(),
            last_sample: None,
            num_pieces: 0,
            bad_pieces: 0,
            changed: false,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
