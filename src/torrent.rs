use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, time};
use crate::{
    config::Config,
    extensions::{
        holepunch::{HolepunchErrorCode, HolepunchMessage},
        metadata::MetadataBuffer,
    },
    info::{FileSpan, TorrentInfo},
    p2p::{state::{ConnState, SessionState}, PeerCommand, PeerHandle, PeerSession},
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::{StoreError, StoreGroup},
    Event, EventTx, ID,
};

// How long a signalled session may take to wind down before shutdown
// stops waiting on it.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::ChannelError(e.to_string())
    }
}

pub enum TorrentCommand {

    // Sent by peer task when the base handshake completes.
    PeerConnected { address: SocketAddr, id: ID },

    PeerState { address: SocketAddr, state: SessionState },

    // Sent by peer task when a piece passed verification and was handed
    // to the store.
    PieceCommitted { idx: usize },

    // Addresses learned from pex or holepunch connect messages.
    PeersDiscovered(Vec<SocketAddr>),

    // The info dict was reassembled from peers and verified.
    MetadataComplete(Vec<u8>),

    // A rendezvous request to relay between two of our peers.
    Holepunch { from: SocketAddr, msg: HolepunchMessage },

    Shutdown,

}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Info-dict bytes for the metadata extension: what we can serve, and
// the reassembly buffer while fetching from peers.
#[derive(Debug, Default)]
pub struct MetadataState {

    pub raw: Option<Arc<Vec<u8>>>,

    pub fetch: Option<MetadataBuffer>,

}

impl MetadataState {
    pub fn size(&self) -> Option<usize> {
        self.raw.as_ref().map(|raw| raw.len())
    }
}

// Read-only state shared with every peer session of this torrent.
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub store: Arc<StoreGroup>,

    pub torrent_tx: TorrentTx,

    pub config: Config,

    pub metadata: tokio::sync::Mutex<MetadataState>,

}

pub struct TorrentParams {

    pub info_hash: ID,

    // Piece geometry from the metadata loader, immutable from here on.
    pub info: TorrentInfo,

    pub piece_hashes: Vec<ID>,

    pub files: Vec<FileSpan>,

    // Raw info-dict bytes if known, served over the metadata extension.
    pub metadata: Option<Vec<u8>>,

    // Initial peers, typically from a tracker or the DHT.
    pub peers: Vec<SocketAddr>,

    pub config: Config,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    torrent_rx: TorrentRx,

    torrent_tx: TorrentTx,

    event_tx: EventTx,

    start_time: Option<Instant>,

    run_duration: Duration,

    throughput: ThroughputStats,

    complete: bool,

}

pub struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

}

impl TorrentHandle {

    // Feeds a candidate peer into the torrent, as if a tracker or DHT
    // lookup had produced it.
    pub fn add_peer(&self, address: SocketAddr) -> Result<()> {
        self.torrent_tx.send(TorrentCommand::PeersDiscovered(vec![address]))?;
        Ok(())
    }

    // Releases every session and flushes the stores before returning.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.torrent_tx.send(TorrentCommand::Shutdown)?;
        if let Some(handle) = self.join_handle.take() {
            handle
                .await
                .map_err(|e| TorrentError::ChannelError(e.to_string()))??;
        }
        Ok(())
    }
}

impl Torrent {

    pub fn spawn(params: TorrentParams, event_tx: EventTx) -> Result<TorrentHandle> {
        let (mut torrent, torrent_tx) = Torrent::new(params, event_tx)?;
        let join_handle = tokio::spawn(async move { torrent.start().await });
        Ok(TorrentHandle {
            torrent_tx,
            join_handle: Some(join_handle),
        })
    }

    fn new(params: TorrentParams, event_tx: EventTx) -> Result<(Self, TorrentTx)> {

        let store = Arc::new(StoreGroup::new(
            params.info,
            params.piece_hashes,
            params.files,
            &params.config.output_dir,
            params.config.flush_threshold,
        )?);
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let complete = store.is_complete()?;

        let torrent = Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: params.info_hash,
                client_id: params.config.client_id,
                store,
                torrent_tx: torrent_tx.clone(),
                config: params.config,
                metadata: tokio::sync::Mutex::new(MetadataState {
                    raw: params.metadata.map(Arc::new),
                    fetch: None,
                }),
            }),
            peers: HashMap::new(),
            available: params.peers,
            torrent_rx,
            torrent_tx: torrent_tx.clone(),
            event_tx,
            start_time: None,
            run_duration: Duration::default(),
            throughput: ThroughputStats::default(),
            complete,
        };
        Ok((torrent, torrent_tx))
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.run().await.map_err(|e| {
            self.event_tx.send(Event::TorrentError(e.to_string())).ok();
            e
        })
    }

    fn connect_to_peers(&mut self) {
        let count = self
            .available
            .len()
            .min(self.ctx.config.max_peers.saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }

        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            let (session, peer_tx) = PeerSession::new(address, self.ctx.clone());
            self.peers.insert(address, PeerHandle::start_session(session, peer_tx, None));
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {

        let mut ticker = time::interval(Duration::from_secs(1));
        let mut pex_ticker = time::interval(self.ctx.config.pex_interval);
        let mut last_tick = None;

        let listener = tokio::net::TcpListener::bind(&self.ctx.config.listen_address).await?;
        tracing::info!("listening on {}", self.ctx.config.listen_address);

        self.connect_to_peers();

        // Top level torrent loop.
        loop { tokio::select! {

            now = ticker.tick() => self.tick(&mut last_tick, now.into_std())?,

            _ = pex_ticker.tick() => self.send_pex_snapshots(),

            new_peer_conn = listener.accept() => {
                let (stream, address) = match new_peer_conn {
                    Ok((stream, address)) => (stream, address),
                    Err(e) => {
                        tracing::warn!("inbound peer connection error: {}", e);
                        continue;
                    },
                };
                if self.peers.len() >= self.ctx.config.max_peers {
                    tracing::debug!("at peer limit, dropping inbound {}", address);
                    continue;
                }
                let (session, peer_tx) = PeerSession::new(address, self.ctx.clone());
                self.peers.insert(address, PeerHandle::start_session(session, peer_tx, Some(stream)));
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    TorrentCommand::PeerConnected { address, id } => {
                        if let Some(peer) = self.peers.get_mut(&address) {
                            peer.id = Some(id);
                        }
                        self.event_tx.send(Event::PeerConnected { address, id }).ok();
                    },

                    TorrentCommand::PeerState { address, state } => {
                        self.handle_peer_state(address, state);
                    },

                    TorrentCommand::PieceCommitted { idx } => self.handle_piece_commit(idx)?,

                    TorrentCommand::PeersDiscovered(addrs) => {
                        self.handle_discovered(addrs);
                    },

                    TorrentCommand::MetadataComplete(raw) => {
                        self.event_tx.send(Event::MetadataResolved { info: raw }).ok();
                    },

                    TorrentCommand::Holepunch { from, msg } => self.relay_holepunch(from, msg),

                    TorrentCommand::Shutdown => {
                        self.shutdown().await?;
                        break;
                    },
                }
            }
        }}

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                tx.send(PeerCommand::Shutdown).ok();
            }
        }

        // Each session gets a bounded window to park its in-flight piece
        // before the stores flush.
        for (address, peer) in self.peers.iter_mut() {
            if let Some(handle) = peer.session_handle.take() {
                match time::timeout(SHUTDOWN_WAIT, handle).await {
                    Err(_) => tracing::warn!("session {} did not stop in time", address),
                    Ok(Ok(Err(e))) => tracing::warn!("session {} shutdown: {}", address, e),
                    Ok(Err(e)) => tracing::warn!("session task {} panicked: {}", address, e),
                    Ok(Ok(Ok(()))) => {},
                }
            }
        }
        self.peers.clear();

        self.ctx.store.flush_all()?;
        Ok(())
    }

    fn handle_piece_commit(&mut self, idx: usize) -> Result<()> {

        let remaining =
            self.ctx.store.info().num_pieces as usize - self.ctx.store.num_downloaded()?;
        tracing::info!("piece {} downloaded, {} pieces remain", idx, remaining);

        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                tx.send(PeerCommand::PieceWritten(idx)).ok();
            }
        }
        self.event_tx.send(Event::PieceCompleted { idx }).ok();

        if remaining == 0 && !self.complete {
            self.complete = true;
            tracing::info!("torrent download complete");
            self.ctx.store.flush_all()?;
            self.event_tx.send(Event::TorrentComplete).ok();
        }
        Ok(())
    }

    fn handle_peer_state(&mut self, address: SocketAddr, state: SessionState) {
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.state = state;
            self.throughput += &state.throughput;

            if peer.state.conn_state == ConnState::Disconnected {
                self.peers.remove(&address);
                self.event_tx.send(Event::PeerDisconnected { address }).ok();
            }
        } else {
            tracing::warn!("peer not found: {}", address);
        }
    }

    fn handle_discovered(&mut self, addrs: Vec<SocketAddr>) {
        let own = self.ctx.config.listen_address;
        for addr in addrs {
            if addr != own && !self.peers.contains_key(&addr) && !self.available.contains(&addr) {
                self.available.push(addr);
            }
        }
        self.connect_to_peers();
    }

    // Swarm snapshot for the pex extension, fanned out to every session.
    // Each session diffs it against what that peer has already been told.
    fn send_pex_snapshots(&mut self) {
        let snapshot: Vec<(SocketAddr, bool)> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state.conn_state == ConnState::Connected)
            .map(|(address, peer)| {
                let seed = peer.state.upload_only
                    || peer.state.num_pieces == self.ctx.store.info().num_pieces as usize;
                (*address, seed)
            })
            .collect();
        if snapshot.is_empty() {
            return;
        }
        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                tx.send(PeerCommand::PexSnapshot(snapshot.clone())).ok();
            }
        }
    }

    // Rendezvous relay: if the target is one of our connected peers, tell
    // both ends to dial each other; otherwise report why not.
    fn relay_holepunch(&mut self, from: SocketAddr, msg: HolepunchMessage) {

        let target = match msg {
            HolepunchMessage::Rendezvous { target } => target,
            // Sessions forward only rendezvous messages.
            _ => return,
        };
        let initiator_tx = match self.peers.get(&from).and_then(|p| p.peer_tx.clone()) {
            Some(tx) => tx,
            None => return,
        };

        if target == from || target == self.ctx.config.listen_address {
            initiator_tx
                .send(PeerCommand::Holepunch(HolepunchMessage::error(
                    target,
                    HolepunchErrorCode::NoSelf,
                )))
                .ok();
            return;
        }

        let peer = match self.peers.get(&target) {
            Some(peer) => peer,
            None => {
                initiator_tx
                    .send(PeerCommand::Holepunch(HolepunchMessage::error(
                        target,
                        HolepunchErrorCode::NoSuchPeer,
                    )))
                    .ok();
                return;
            }
        };
        let target_tx = match &peer.peer_tx {
            Some(tx) if peer.state.conn_state == ConnState::Connected => tx,
            _ => {
                initiator_tx
                    .send(PeerCommand::Holepunch(HolepunchMessage::error(
                        target,
                        HolepunchErrorCode::NotConnected,
                    )))
                    .ok();
                return;
            }
        };
        if !peer.state.holepunch {
            initiator_tx
                .send(PeerCommand::Holepunch(HolepunchMessage::error(
                    target,
                    HolepunchErrorCode::NoSupport,
                )))
                .ok();
            return;
        }

        tracing::debug!("relaying holepunch rendezvous {} <-> {}", from, target);
        target_tx
            .send(PeerCommand::Holepunch(HolepunchMessage::Connect { target: from }))
            .ok();
        initiator_tx
            .send(PeerCommand::Holepunch(HolepunchMessage::Connect { target }))
            .ok();
    }

    fn tick(&mut self, last_tick: &mut Option<Instant>, time: Instant) -> Result<()> {

        let elapsed_since_tick = last_tick
            .or(self.start_time)
            .map(|t| time.saturating_duration_since(t))
            .unwrap_or_default();
        self.run_duration += elapsed_since_tick;
        *last_tick = Some(time);

        let stats = self.build_stats()?;
        self.event_tx.send(Event::TorrentStats { stats }).ok();
        self.throughput.reset();

        Ok(())
    }

    fn build_stats(&mut self) -> Result<TorrentStats> {

        let peer_stats = self
            .peers
            .iter()
            .map(|(address, peer)| PeerStats {
                address: *address,
                state: peer.state,
            })
            .collect();

        Ok(TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.run_duration,
            piece_stats: PieceStats {
                num_pieces: self.ctx.store.info().num_pieces as usize,
                num_downloaded: self.ctx.store.num_downloaded()?,
            },
            throughput: self.throughput,
            peer_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::{PeerError, PeerRx};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    fn test_torrent(dir: &std::path::Path) -> Torrent {
        let piece_len = 0x4000;
        let params = TorrentParams {
            info_hash: [7u8; 20],
            info: TorrentInfo::new(piece_len as u64 * 2, piece_len),
            piece_hashes: vec![[0u8; 20]; 2],
            files: vec![FileSpan {
                path: "data.bin".into(),
                len: piece_len * 2,
                offset: 0,
            }],
            metadata: None,
            peers: Vec::new(),
            config: Config {
                output_dir: dir.to_path_buf(),
                ..Config::default()
            },
        };
        let (event_tx, _) = mpsc::unbounded_channel();
        let (torrent, _) = Torrent::new(params, event_tx).unwrap();
        torrent
    }

    fn peer(conn_state: ConnState, holepunch: bool) -> (PeerHandle, PeerRx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut state = SessionState::default();
        state.conn_state = conn_state;
        state.holepunch = holepunch;
        (
            PeerHandle {
                id: None,
                peer_tx: Some(peer_tx),
                state,
                session_handle: None,
            },
            peer_rx,
        )
    }

    fn relayed(rx: &mut PeerRx) -> HolepunchMessage {
        match rx.try_recv() {
            Ok(PeerCommand::Holepunch(msg)) => msg,
            Ok(_) => panic!("unexpected command on peer channel"),
            Err(e) => panic!("no relay reply: {}", e),
        }
    }

    #[test]
    fn test_holepunch_relay_replies() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = test_torrent(dir.path());

        let (initiator, mut initiator_rx) = peer(ConnState::Connected, true);
        torrent.peers.insert(addr(1), initiator);

        // Target not in the swarm.
        torrent.relay_holepunch(addr(1), HolepunchMessage::Rendezvous { target: addr(9) });
        assert_eq!(
            relayed(&mut initiator_rx),
            HolepunchMessage::error(addr(9), HolepunchErrorCode::NoSuchPeer),
        );

        // Target known but its session is still handshaking.
        let (pending, _pending_rx) = peer(ConnState::Handshaking, false);
        torrent.peers.insert(addr(2), pending);
        torrent.relay_holepunch(addr(1), HolepunchMessage::Rendezvous { target: addr(2) });
        assert_eq!(
            relayed(&mut initiator_rx),
            HolepunchMessage::error(addr(2), HolepunchErrorCode::NotConnected),
        );

        // Target connected but never declared the holepunch sub-protocol.
        let (plain, _plain_rx) = peer(ConnState::Connected, false);
        torrent.peers.insert(addr(3), plain);
        torrent.relay_holepunch(addr(1), HolepunchMessage::Rendezvous { target: addr(3) });
        assert_eq!(
            relayed(&mut initiator_rx),
            HolepunchMessage::error(addr(3), HolepunchErrorCode::NoSupport),
        );

        // Rendezvous pointed back at the relay itself.
        let own = torrent.ctx.config.listen_address;
        torrent.relay_holepunch(addr(1), HolepunchMessage::Rendezvous { target: own });
        assert_eq!(
            relayed(&mut initiator_rx),
            HolepunchMessage::error(own, HolepunchErrorCode::NoSelf),
        );

        // Eligible target: both ends are told to dial each other.
        let (capable, mut capable_rx) = peer(ConnState::Connected, true);
        torrent.peers.insert(addr(4), capable);
        torrent.relay_holepunch(addr(1), HolepunchMessage::Rendezvous { target: addr(4) });
        assert_eq!(
            relayed(&mut capable_rx),
            HolepunchMessage::Connect { target: addr(1) },
        );
        assert_eq!(
            relayed(&mut initiator_rx),
            HolepunchMessage::Connect { target: addr(4) },
        );
    }

    // A session that never winds down must not hold the flush hostage.
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_on_stuck_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = test_torrent(dir.path());

        let (mut stuck, _stuck_rx) = peer(ConnState::Connected, false);
        stuck.session_handle = Some(tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok::<(), PeerError>(())
        }));
        torrent.peers.insert(addr(1), stuck);

        torrent.shutdown().await.unwrap();
        assert!(torrent.peers.is_empty());
    }
}
