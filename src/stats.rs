use crate::p2p::state::SessionState;

#[derive(Debug, Default)]
pub struct TorrentStats {

    pub start_time: Option<std::time::Instant>,

    pub time_elapsed: std::time::Duration,

    pub piece_stats: PieceStats,

    pub peer_stats: Vec<PeerStats>,

    pub throughput: ThroughputStats,

}

#[derive(Debug, Default)]
pub struct PieceStats {

    pub num_pieces: usize,

    pub num_downloaded: usize,

}

impl PieceStats {
    pub fn is_seed(&self) -> bool {
        self.num_downloaded == self.num_pieces
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeerStats {

    pub address: std::net::SocketAddr,

    pub state: SessionState,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.up += other.up.round();
        self.down += other.down.round();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }

}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

// Bytes moved since the last sample, read and reset by the eviction
// policy living outside this crate. Mutation belongs to the owning
// connection alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerScore {

    uploaded: u64,

    downloaded: u64,

    // The first read after connect is discarded so a fresh connection is
    // not evicted for having no history.
    sampled: bool,

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreSample {
    pub uploaded: u64,
    pub downloaded: u64,
}

impl PeerScore {

    pub fn record_up(&mut self, n: u64) {
        self.uploaded += n;
    }

    pub fn record_down(&mut self, n: u64) {
        self.downloaded += n;
    }

    // Returns None once, for the grace period.
    pub fn take_sample(&mut self) -> Option<ScoreSample> {
        let sample = ScoreSample {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
        };
        self.uploaded = 0;
        self.downloaded = 0;
        if !self.sampled {
            self.sampled = true;
            return None;
        }
        Some(sample)
    }
}
