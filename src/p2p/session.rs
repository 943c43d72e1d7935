use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    extensions::{
        holepunch::HolepunchMessage,
        metadata::{self, MetadataMessage, MetadataBuffer},
        pex::PexState,
        Capabilities, ExtendedHandshake, ExtendedMessage, HANDSHAKE_ID,
    },
    store::{CommitOutcome, PieceSlice},
    torrent::{TorrentCommand, TorrentContext},
    Bitfield, BLOCK_SIZE, ID,
};
use super::{*, codec::*, handshake::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Connections with nothing to say in either direction are dropped.
const INACTIVITY_SECS: u64 = 30;

// Keep-alive cadence when the connection is otherwise quiet.
const KEEP_ALIVE_SECS: u64 = 90;

// Pieces offered to the peer for download while it is choked.
const ALLOWED_FAST_COUNT: usize = 10;

// Canonical allowed-fast set (fast extension): iterated digests over the
// peer's masked address and the info hash, so both sides can derive the
// same offer without a message exchange.
fn allowed_fast_set(info_hash: &ID, ip: IpAddr, num_pieces: u32, count: usize) -> Vec<usize> {
    if num_pieces == 0 {
        return Vec::new();
    }
    // The low octet (v4) is masked off so peers behind the same NAT
    // derive the same set.
    let ip_bytes = match ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let count = count.min(num_pieces as usize);
    let mut set = Vec::with_capacity(count);
    let mut x = crypto::sha1(&[&ip_bytes, info_hash.as_slice()]).to_vec();
    while set.len() < count {
        for chunk in x.chunks(4) {
            if set.len() >= count {
                break;
            }
            let idx = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !set.contains(&(idx as usize)) {
                set.push(idx as usize);
            }
        }
        x = crypto::sha1(&[&x]).to_vec();
    }
    set
}

// The piece this connection is currently downloading. Blocks are
// requested in order up to the pipeline depth; arrivals are matched
// against the outstanding window by (piece, offset, length).
struct InFlightPiece {

    slice: PieceSlice,

    buf: Vec<u8>,

    // Blocks not yet requested, in reverse order so pop() walks the
    // piece front to back.
    pending: Vec<BlockInfo>,

    // Requests on the wire awaiting their block.
    window: HashSet<BlockInfo>,

    received: usize,

    last_arrival: Instant,

}

impl InFlightPiece {

    fn new(slice: PieceSlice) -> Self {
        let len = slice.len();
        let mut pending = Vec::with_capacity((len + BLOCK_SIZE - 1) / BLOCK_SIZE);
        let mut offset = 0;
        while offset < len {
            let block_len = BLOCK_SIZE.min(len - offset);
            pending.push(BlockInfo { piece_idx: slice.idx, offset, len: block_len });
            offset += block_len;
        }
        pending.reverse();
        Self {
            slice,
            buf: vec![0; len],
            pending,
            window: HashSet::new(),
            received: 0,
            last_arrival: Instant::now(),
        }
    }

    fn complete(&self) -> bool {
        self.received == self.buf.len()
    }
}

pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is read-only state shared with the torrent task.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Internal send channel for store reads.
    peer_tx: PeerTx,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    // Pending block requests from the peer to the client.
    requests_in: HashSet<BlockInfo>,

    in_flight: Option<InFlightPiece>,

    // Pieces downloadable while choked (fast extension).
    allowed_fast: HashSet<usize>,

    // Pieces we offered the peer for download while it is choked.
    allowed_fast_out: HashSet<usize>,

    // What the peer declared in its extended handshake.
    caps: Capabilities,

    peer_fast: bool,

    peer_extended: bool,

    // Delta state for peer exchange.
    pex: PexState,

    connect_time: Option<Instant>,

    last_send: Instant,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.store.info().num_pieces as usize);

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                requests_in: HashSet::new(),
                in_flight: None,
                allowed_fast: HashSet::new(),
                allowed_fast_out: HashSet::new(),
                caps: Capabilities::default(),
                peer_fast: false,
                peer_extended: false,
                pex: PexState::default(),
                connect_time: None,
                last_send: Instant::now(),
                state: SessionState::default(),
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {
        let result = self.connect(inbound_stream).await;
        if let Err(e) = &result {
            tracing::warn!("session ended with error: {}", e);
        }
        self.release();
        result
    }

    async fn connect(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let timeout = self.torrent_ctx.config.handshake_timeout;
        let inbound = inbound_stream.is_some();
        let mut stream = match inbound_stream {
            Some(stream) => stream,
            None => {
                let stream = time::timeout(timeout, TcpStream::connect(self.address))
                    .await
                    .map_err(|_| PeerError::Timeout)??;
                tracing::trace!("outbound connection successful");
                stream
            }
        };

        // Obfuscation negotiation first, bounded so a stalled peer can't
        // hold the slot. Soft failures inside come back as a plaintext
        // channel; the policy decides below whether that sticks.
        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let policy = self.torrent_ctx.config.encryption;
        let crypto = if inbound {
            let torrents = [self.torrent_ctx.info_hash];
            let (crypto, discovered) =
                time::timeout(timeout, establish_inbound(&mut stream, &torrents, policy))
                    .await
                    .map_err(|_| PeerError::Timeout)??;
            if let Some(hash) = discovered {
                if hash != self.torrent_ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
            }
            crypto
        } else {
            time::timeout(
                timeout,
                establish_outbound(&mut stream, &self.torrent_ctx.info_hash, policy),
            )
            .await
            .map_err(|_| PeerError::Timeout)??
        };

        let encrypted = crypto.encrypted();
        self.state.update(|state| state.encrypted = encrypted);
        tracing::info!(encrypted, "obfuscation handshake done");

        // Leftover bytes from the negotiation seed the framed buffer, and
        // the cipher channel rides along so keystream position carries
        // over into the message codec.
        let channel = crypto
            .cipher
            .map(|pair| CipherChannel::new(pair, crypto.plain_prefix));
        let mut parts = FramedParts::new::<Handshake>(stream, HandshakeCodec::new(channel));
        parts.read_buf = crypto.leftover;
        let mut socket = Framed::from_parts(parts);

        self.exchange_handshake(&mut socket, inbound).await?;

        let parts = socket.into_parts();
        let mut msg_parts = FramedParts::new::<Message>(
            parts.io,
            MessageCodec::new(parts.codec.into_channel()),
        );
        msg_parts.read_buf = parts.read_buf;
        msg_parts.write_buf = parts.write_buf;
        let socket = Framed::from_parts(msg_parts);

        self.run(socket).await
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<()> {

        let handshake = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id);

        if !inbound {
            tracing::info!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        if let Some(Ok(handshake)) = socket.next().await {
            tracing::info!("read: handshake");

            if handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if handshake.info_hash != self.torrent_ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }
            self.peer_fast = handshake.supports_fast();
            self.peer_extended = handshake.supports_extended();

            if inbound {
                tracing::info!("send handshake");
                let ours = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id);
                socket.send(ours).await?;
            }

            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerConnected {
                address: self.address,
                id: handshake.peer_id,
            })?;
            tracing::info!("handshake successful, peer connected");
            Ok(())

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.connect_time = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(time::Duration::from_secs(1));

        self.introduce(&mut sink).await?;

        loop { tokio::select! {

            // Message from peer.
            Some(msg) = stream.next() => self.handle_msg(&mut sink, msg?).await?,

            // Command from elsewhere in application.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    // From the store, answering an upload request.
                    PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await?,

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::PexSnapshot(snapshot) => self.send_pex(&mut sink, &snapshot).await?,

                    PeerCommand::Holepunch(msg) => {
                        if let Some(id) = self.caps.holepunch {
                            self.send_extended(&mut sink, id, &ExtendedMessage::Holepunch(msg)).await?;
                        }
                    },

                    // From torrent.
                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },

                }
            }

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

        }}

        Ok(())
    }

    // On teardown: a piece still in flight goes back to the store so
    // another connection can retry it.
    fn release(&mut self) {
        if let Some(piece) = self.in_flight.take() {
            tracing::trace!("parking in-flight piece {}", piece.slice.idx);
            self.torrent_ctx.store.park(piece.slice.idx).ok();
        }
        self.state.update(|state| *state = SessionState {
            conn_state: ConnState::Disconnected,
            ..SessionState::default()
        });
        self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    // First messages after the handshake: the extended handshake if both
    // sides speak it, then what we have.
    async fn introduce(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.peer_extended {
            let metadata_size = self.torrent_ctx.metadata.lock().await.size();
            let hs = ExtendedHandshake::ours(
                self.torrent_ctx.config.listen_address.port(),
                metadata_size,
                self.torrent_ctx.store.is_complete()?,
            );
            let payload = hs.encode()?;
            self.send_message(sink, Message::Extended { id: HANDSHAKE_ID, payload }).await?;
        }

        let own = self.torrent_ctx.store.bitfield()?;
        if self.peer_fast && own.not_any() {
            self.send_message(sink, Message::HaveNone).await?;
        } else if self.peer_fast && own.count_ones() == own.len() {
            self.send_message(sink, Message::HaveAll).await?;
        } else if own.any() {
            self.send_message(sink, Message::Bitfield(own)).await?;
        }

        // Offer a set of pieces the peer may request while choked. Both
        // sides derive the same indices, so the offer doubles as a probe
        // that the peer computes them correctly.
        if self.peer_fast {
            let set = allowed_fast_set(
                &self.torrent_ctx.info_hash,
                self.address.ip(),
                self.torrent_ctx.store.info().num_pieces,
                ALLOWED_FAST_COUNT,
            );
            for idx in set {
                self.allowed_fast_out.insert(idx);
                self.send_message(sink, Message::AllowedFast { idx: idx as u32 }).await?;
            }
        }
        Ok(())
    }

    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        self.last_send = Instant::now();
        sink.send(msg).await
    }

    async fn send_extended(
        &mut self,
        sink: &mut MessageSink,
        id: u8,
        msg: &ExtendedMessage,
    ) -> Result<()> {
        let payload = msg.encode()?;
        self.send_message(sink, Message::Extended { id, payload }).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);

        // The extended handshake (and keep-alives) travel before the
        // bitfield, so they must not close the introduction window.
        let keeps_introducing = matches!(msg, Message::KeepAlive | Message::Extended { .. });

        match msg {

            // Bitfield and its fast-extension stand-ins can only be sent
            // directly after the handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state != ConnState::Introducing {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            },

            Message::HaveAll => {
                if self.state.conn_state != ConnState::Introducing {
                    return Err(PeerError::UnexpectedBitfield);
                }
                let full = Bitfield::repeat(true, self.bitfield.len());
                self.handle_bitfield(sink, full).await?;
            },

            Message::HaveNone => {
                if self.state.conn_state != ConnState::Introducing {
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    self.handle_choked()?;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = true);
                    self.send_message(sink, Message::Unchoke).await?;
                    self.state.choked = false;
                }
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Cancel(block) => {
                self.requests_in.remove(&block);
            },

            // DHT is outside this crate; nothing to hand the port to.
            Message::Port { port } => tracing::trace!("peer dht port: {}", port),

            Message::Suggest { idx } => tracing::trace!("peer suggests piece {}", idx),

            Message::Reject(block) => self.handle_reject(block)?,

            Message::AllowedFast { idx } => {
                if (idx as usize) < self.bitfield.len() {
                    self.allowed_fast.insert(idx as usize);
                    if self.state.peer_choking && self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Extended { id, payload } => self.handle_extended(sink, id, payload).await?,

        }

        if !keeps_introducing && self.state.conn_state == ConnState::Introducing {
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.torrent_ctx.store.info().num_pieces as usize;
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);
        // Remove trailing bits.
        bitfield.resize(num_pieces, false);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        // If idx is not valid, disconnect.
        if idx as usize >= self.bitfield.len() {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);
        self.update_interest(sink).await?;
        if !self.state.peer_choking && self.state.interested {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    // Choking invalidates the outstanding window. The in-flight piece
    // survives only if the peer marked it allowed-fast.
    fn handle_choked(&mut self) -> Result<()> {
        let parked = self
            .in_flight
            .as_ref()
            .map(|piece| !self.allowed_fast.contains(&piece.slice.idx))
            .unwrap_or(false);
        if parked {
            if let Some(piece) = self.in_flight.take() {
                self.torrent_ctx.store.park(piece.slice.idx)?;
            }
        }
        Ok(())
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        };
        let piece = match self.in_flight.as_mut() {
            Some(piece) if piece.window.contains(&info) => piece,
            _ => {
                tracing::warn!("unexpected block: {:?}", info);
                return Ok(());
            }
        };

        piece.window.remove(&info);
        piece.buf[info.offset..info.offset + info.len].copy_from_slice(&block.data);
        piece.received += info.len;
        piece.last_arrival = Instant::now();
        self.state.update(|state| {
            state.throughput.down += info.len as u64;
            state.score.record_down(info.len as u64);
        });

        if piece.complete() {
            self.complete_piece().await?;
        }
        Ok(())
    }

    // Hands the full piece to the store. Verification hashes the whole
    // piece and the write may flush, so it runs on a blocking thread,
    // bounded by the completion timeout.
    async fn complete_piece(&mut self) -> Result<()> {
        let piece = match self.in_flight.take() {
            Some(piece) => piece,
            None => return Ok(()),
        };
        let idx = piece.slice.idx;
        let store = Arc::clone(&self.torrent_ctx.store);
        let data = piece.buf;

        let outcome = time::timeout(
            self.torrent_ctx.config.completion_timeout,
            tokio::task::spawn_blocking(move || store.commit(idx, &data)),
        )
        .await
        .map_err(|_| PeerError::Timeout)?
        .map_err(|e| PeerError::Channel(e.to_string()))??;

        match outcome {
            CommitOutcome::Written => {
                tracing::info!("piece {} verified and committed", idx);
                self.torrent_ctx.torrent_tx.send(TorrentCommand::PieceCommitted { idx })?;
            }
            CommitOutcome::AlreadyPresent => {
                tracing::warn!("piece {} was already present", idx);
            }
            CommitOutcome::HashMismatch => {
                self.state.update(|state| state.bad_pieces += 1);
                self.torrent_ctx.store.park(idx)?;
                if self.state.bad_pieces >= self.torrent_ctx.config.bad_piece_limit {
                    return Err(PeerError::BadPeer(self.state.bad_pieces));
                }
            }
        }
        Ok(())
    }

    // Picks a piece if none is in flight and tops the request window up
    // to the pipeline depth. While choked only allowed-fast pieces are
    // eligible.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if !self.state.interested {
            return Ok(());
        }
        if self.state.peer_choking && self.allowed_fast.is_empty() {
            return Ok(());
        }

        if self.in_flight.is_none() {
            let restrict = self.state.peer_choking.then(|| &self.allowed_fast);
            match self.torrent_ctx.store.pick(&self.bitfield, restrict)? {
                Some(slice) => {
                    tracing::trace!("picked piece {}", slice.idx);
                    self.in_flight = Some(InFlightPiece::new(slice));
                }
                None => return Ok(()),
            }
        }

        let depth = self.torrent_ctx.config.pipeline_depth;
        let mut requests = Vec::new();
        if let Some(piece) = self.in_flight.as_mut() {
            while piece.window.len() < depth {
                match piece.pending.pop() {
                    Some(block) => {
                        piece.window.insert(block);
                        requests.push(block);
                    }
                    None => break,
                }
            }
        }
        for block in requests {
            self.send_message(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    // A rejected request goes back in the pending queue; if the peer is
    // choking us and the piece isn't allowed-fast it is given up whole.
    fn handle_reject(&mut self, block: BlockInfo) -> Result<()> {
        let parked = match self.in_flight.as_mut() {
            Some(piece) if piece.window.contains(&block) => {
                piece.window.remove(&block);
                piece.pending.push(block);
                self.state.peer_choking && !self.allowed_fast.contains(&piece.slice.idx)
            }
            _ => {
                tracing::warn!("reject for unrequested block: {:?}", block);
                false
            }
        };
        if parked {
            if let Some(piece) = self.in_flight.take() {
                self.torrent_ctx.store.park(piece.slice.idx)?;
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        // Choked requests are still served for pieces in the offered
        // allowed-fast set.
        if self.state.choked && !self.allowed_fast_out.contains(&request.piece_idx) {
            tracing::warn!("request whilst choked: {:?}", request);
            if self.peer_fast {
                return self.send_message(sink, Message::Reject(request)).await;
            }
            return Err(PeerError::InvalidMessage);
        }
        let info = self.torrent_ctx.store.info();
        if request.piece_idx >= info.num_pieces as usize
            || request.len == 0
            || request.len > 2 * BLOCK_SIZE
            || request.offset + request.len > info.piece_length(request.piece_idx)
        {
            tracing::error!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        if !self.torrent_ctx.store.has_piece(request.piece_idx)? {
            if self.peer_fast {
                return self.send_message(sink, Message::Reject(request)).await;
            }
            return Ok(());
        }
        if !self.requests_in.insert(request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }

        // Read off the async threads; the block comes back as a command.
        let store = Arc::clone(&self.torrent_ctx.store);
        let peer_tx = self.peer_tx.clone();
        tokio::task::spawn_blocking(move || {
            match store.read_block(request.piece_idx, request.offset, request.len) {
                Ok(data) => {
                    peer_tx
                        .send(PeerCommand::BlockRead(BlockData {
                            piece_idx: request.piece_idx,
                            offset: request.offset,
                            data,
                        }))
                        .ok();
                }
                Err(e) => tracing::error!("block read failed: {}", e),
            }
        });
        Ok(())
    }

    // Remove the request and send peer the block.
    async fn send_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {
        let info = BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        };
        if !self.requests_in.remove(&info) {
            // Cancelled while the read was queued.
            tracing::trace!("block read but no request: {:?}", info);
            return Ok(());
        }
        self.send_message(sink, Message::Block(block)).await?;
        self.state.update(|state| {
            state.throughput.up += info.len as u64;
            state.score.record_up(info.len as u64);
        });
        Ok(())
    }

    // When another connection commits a piece, advertise it here unless
    // the peer already has it.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }
        if self.torrent_ctx.store.is_complete()? {
            self.update_interest(sink).await?;
            if let Some(id) = self.caps.upload_only {
                self.send_extended(sink, id, &ExtendedMessage::UploadOnly(true)).await?;
            }
        }
        Ok(())
    }

    async fn send_pex(
        &mut self,
        sink: &mut MessageSink,
        snapshot: &[(SocketAddr, bool)],
    ) -> Result<()> {
        let id = match self.caps.pex {
            Some(id) => id,
            None => return Ok(()),
        };
        let snapshot: Vec<_> = snapshot
            .iter()
            .filter(|(addr, _)| *addr != self.address)
            .copied()
            .collect();
        let msg = self.pex.delta(&snapshot);
        if !msg.is_empty() {
            self.send_extended(sink, id, &ExtendedMessage::Pex(msg)).await?;
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        sink: &mut MessageSink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match ExtendedMessage::decode(id, &payload)? {

            ExtendedMessage::Handshake(hs) => {
                self.caps = Capabilities::from(&hs);
                let upload_only = hs.upload_only.unwrap_or(0) != 0;
                let holepunch = self.caps.holepunch.is_some();
                self.state.update(|state| {
                    state.upload_only = upload_only;
                    state.holepunch = holepunch;
                });
                tracing::info!(caps = ?self.caps, "peer extended handshake");

                // Two seeds have nothing to trade.
                if upload_only && self.torrent_ctx.store.is_complete()? {
                    tracing::info!("both sides seeding, disconnecting");
                    self.peer_tx.send(PeerCommand::Shutdown)?;
                    return Ok(());
                }
                self.maybe_fetch_metadata(sink).await?;
            }

            ExtendedMessage::Pex(msg) => {
                if !msg.added.is_empty() {
                    let addrs = msg.added.iter().map(|(addr, _)| *addr).collect();
                    self.torrent_ctx.torrent_tx.send(TorrentCommand::PeersDiscovered(addrs))?;
                }
            }

            ExtendedMessage::Metadata(msg) => self.handle_metadata(sink, msg).await?,

            // Holepunch from a peer that never declared it is silently
            // dropped; answering would confuse clients that assign the id
            // to something else.
            ExtendedMessage::Holepunch(msg) => {
                if self.caps.holepunch.is_none() {
                    tracing::trace!("holepunch from non-declaring peer ignored");
                    return Ok(());
                }
                match msg {
                    HolepunchMessage::Rendezvous { .. } => {
                        self.torrent_ctx.torrent_tx.send(TorrentCommand::Holepunch {
                            from: self.address,
                            msg,
                        })?;
                    }
                    HolepunchMessage::Connect { target } => {
                        self.torrent_ctx.torrent_tx
                            .send(TorrentCommand::PeersDiscovered(vec![target]))?;
                    }
                    HolepunchMessage::Error { target, code } => {
                        tracing::debug!("holepunch error {} for {}", code, target);
                    }
                }
            }

            ExtendedMessage::DontHave { idx } => {
                if (idx as usize) < self.bitfield.len() && self.bitfield[idx as usize] {
                    self.bitfield.set(idx as usize, false);
                    self.state.update(|state| state.num_pieces -= 1);
                }
            }

            ExtendedMessage::UploadOnly(flag) => {
                self.state.update(|state| state.upload_only = flag);
            }
        }
        Ok(())
    }

    // Kicks off an info-dict fetch if we joined with only the hash and
    // this peer can serve it.
    async fn maybe_fetch_metadata(&mut self, sink: &mut MessageSink) -> Result<()> {
        let id = match (self.caps.metadata, self.caps.metadata_size) {
            (Some(id), Some(size)) if size > 0 => {
                let mut meta = self.torrent_ctx.metadata.lock().await;
                if meta.raw.is_some() {
                    return Ok(());
                }
                if meta.fetch.is_none() {
                    meta.fetch = Some(MetadataBuffer::new(size));
                }
                id
            }
            _ => return Ok(()),
        };
        if let Some(piece) = self.next_metadata_request().await {
            self.send_extended(sink, id, &ExtendedMessage::Metadata(MetadataMessage::Request { piece }))
                .await?;
        }
        Ok(())
    }

    async fn next_metadata_request(&self) -> Option<u32> {
        self.torrent_ctx.metadata.lock().await.fetch.as_ref()?.next_request()
    }

    async fn handle_metadata(&mut self, sink: &mut MessageSink, msg: MetadataMessage) -> Result<()> {
        match msg {

            MetadataMessage::Request { piece } => {
                let id = match self.caps.metadata {
                    Some(id) => id,
                    None => return Ok(()),
                };
                let reply = {
                    let meta = self.torrent_ctx.metadata.lock().await;
                    match &meta.raw {
                        Some(raw) if metadata::piece_len(piece, raw.len()) > 0 => {
                            let offset = piece as usize * metadata::METADATA_PIECE_LEN;
                            let len = metadata::piece_len(piece, raw.len());
                            MetadataMessage::Data {
                                piece,
                                total_size: raw.len(),
                                data: raw[offset..offset + len].to_vec(),
                            }
                        }
                        _ => MetadataMessage::Reject { piece },
                    }
                };
                self.send_extended(sink, id, &ExtendedMessage::Metadata(reply)).await?;
            }

            MetadataMessage::Data { piece, data, .. } => {
                let (resolved, next) = {
                    let mut meta = self.torrent_ctx.metadata.lock().await;
                    let buffer = match meta.fetch.as_mut() {
                        Some(buffer) => buffer,
                        None => return Ok(()),
                    };
                    buffer.insert(piece, data);
                    match buffer.try_assemble(&self.torrent_ctx.info_hash) {
                        Some(raw) => {
                            meta.raw = Some(Arc::new(raw.clone()));
                            meta.fetch = None;
                            (Some(raw), None)
                        }
                        None => (None, meta.fetch.as_ref().and_then(|b| b.next_request())),
                    }
                };
                if let Some(raw) = resolved {
                    tracing::info!("metadata resolved, {} bytes", raw.len());
                    self.torrent_ctx.torrent_tx.send(TorrentCommand::MetadataComplete(raw))?;
                } else if let Some(piece) = next {
                    if let Some(id) = self.caps.metadata {
                        self.send_extended(
                            sink,
                            id,
                            &ExtendedMessage::Metadata(MetadataMessage::Request { piece }),
                        )
                        .await?;
                    }
                }
            }

            MetadataMessage::Reject { piece } => {
                tracing::debug!("metadata request for piece {} rejected", piece);
            }
        }
        Ok(())
    }

    // Become interested when the peer has pieces we lack, drop interest
    // once it has nothing left for us.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let interested = self.torrent_ctx.store.wants_any(&self.bitfield)?;
        if interested && !self.state.interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
        } else if !interested && self.state.interested {
            self.state.update(|state| state.interested = false);
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, time: Instant) -> Result<()> {

        // A stalled window abandons the piece so another peer can take it.
        let timed_out = self
            .in_flight
            .as_ref()
            .map(|piece| {
                !piece.window.is_empty()
                    && time.saturating_duration_since(piece.last_arrival)
                        >= self.torrent_ctx.config.request_timeout
            })
            .unwrap_or(false);
        if timed_out {
            if let Some(piece) = self.in_flight.take() {
                tracing::warn!("request timeout, parking piece {}", piece.slice.idx);
                self.torrent_ctx.store.park(piece.slice.idx)?;
            }
        }

        if !self.state.interested
        && !self.state.peer_interested
        && self.connect_time
            .map(|t| time.saturating_duration_since(t) >= time::Duration::from_secs(INACTIVITY_SECS))
            .unwrap_or(false)
        {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }

        if time.saturating_duration_since(self.last_send)
            >= time::Duration::from_secs(KEEP_ALIVE_SECS)
        {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        // Send stats if there is a state change. Each report carries the
        // bytes moved since the previous one; the first after connect is
        // blanked by the score's grace period.
        if self.state.changed {
            self.state.changed = false;
            self.state.last_sample = self.state.score.take_sample();
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        info::{FileSpan, TorrentInfo},
        stats::ScoreSample,
        store::StoreGroup,
        torrent::{MetadataState, TorrentRx},
    };

    const TEST_PIECE_LEN: usize = 0x8000;

    fn test_context(dir: &std::path::Path) -> (Arc<TorrentContext>, TorrentRx) {
        let info = TorrentInfo::new((TEST_PIECE_LEN * 3) as u64, TEST_PIECE_LEN);
        let spans = vec![FileSpan { path: "a.bin".into(), len: TEST_PIECE_LEN * 3, offset: 0 }];
        let hashes = vec![[0u8; 20]; 3];
        let store = StoreGroup::new(info, hashes, spans, dir, usize::MAX).unwrap();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            info_hash: [7u8; 20],
            client_id: [1u8; 20],
            store: Arc::new(store),
            torrent_tx,
            config: Config::default(),
            metadata: tokio::sync::Mutex::new(MetadataState::default()),
        });
        (ctx, torrent_rx)
    }

    // A real socket pair so the sink half has somewhere to write; the
    // remote end is kept alive but never read.
    async fn loopback_sink() -> (MessageSink, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let outbound = TcpStream::connect(address).await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        let (sink, _stream) = Framed::new(outbound, MessageCodec::plaintext()).split();
        (sink, remote)
    }

    // The extended handshake arrives before the bitfield in every modern
    // client; it must leave the introduction window open.
    #[tokio::test]
    async fn test_extended_handshake_precedes_bitfield() {
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, _torrent_rx) = test_context(dir.path());
        let (mut session, _peer_tx) = PeerSession::new("10.0.0.1:6881".parse().unwrap(), ctx);
        session.state.conn_state = ConnState::Introducing;
        let (mut sink, _remote) = loopback_sink().await;

        let payload = ExtendedHandshake::default().encode().unwrap();
        session
            .handle_msg(&mut sink, Message::Extended { id: HANDSHAKE_ID, payload })
            .await
            .unwrap();
        assert_eq!(session.state.conn_state, ConnState::Introducing);

        session.handle_msg(&mut sink, Message::KeepAlive).await.unwrap();
        assert_eq!(session.state.conn_state, ConnState::Introducing);

        session.handle_msg(&mut sink, Message::HaveNone).await.unwrap();
        assert_eq!(session.state.conn_state, ConnState::Connected);
    }

    // A stalled request window gives the piece back to the group: skipped
    // for one pick cycle, up for grabs after.
    #[tokio::test]
    async fn test_request_timeout_parks_piece() {
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, _torrent_rx) = test_context(dir.path());
        let (mut session, _peer_tx) =
            PeerSession::new("10.0.0.1:6881".parse().unwrap(), Arc::clone(&ctx));
        let (mut sink, _remote) = loopback_sink().await;

        let peer_has = Bitfield::repeat(true, 3);
        let slice = ctx.store.pick(&peer_has, None).unwrap().unwrap();
        assert_eq!(slice.idx, 0);
        let mut piece = InFlightPiece::new(slice);
        let block = piece.pending.pop().unwrap();
        piece.window.insert(block);
        session.in_flight = Some(piece);

        let later = Instant::now() + ctx.config.request_timeout;
        session.tick(&mut sink, later).await.unwrap();

        assert!(session.in_flight.is_none());
        assert_eq!(ctx.store.pick(&peer_has, None).unwrap().unwrap().idx, 1);
        assert_eq!(ctx.store.pick(&peer_has, None).unwrap().unwrap().idx, 0);
    }

    #[tokio::test]
    async fn test_score_sampled_when_state_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let (ctx, mut torrent_rx) = test_context(dir.path());
        let (mut session, _peer_tx) = PeerSession::new("10.0.0.1:6881".parse().unwrap(), ctx);
        let (mut sink, _remote) = loopback_sink().await;

        let report = |rx: &mut TorrentRx| match rx.try_recv() {
            Ok(TorrentCommand::PeerState { state, .. }) => state,
            _ => panic!("expected a state report"),
        };

        // First report after connect falls in the grace period.
        session.state.update(|state| state.score.record_down(512));
        session.tick(&mut sink, Instant::now()).await.unwrap();
        assert_eq!(report(&mut torrent_rx).last_sample, None);

        session.state.update(|state| state.score.record_down(256));
        session.tick(&mut sink, Instant::now()).await.unwrap();
        assert_eq!(
            report(&mut torrent_rx).last_sample,
            Some(ScoreSample { uploaded: 0, downloaded: 256 })
        );
    }

    #[test]
    fn test_in_flight_block_layout() {
        let slice = PieceSlice { idx: 3, begin: 0x18000, end: 0x18000 + 0x9000 };
        let mut piece = InFlightPiece::new(slice);

        // 0x9000 bytes is two full blocks and one 0x1000 tail.
        assert_eq!(piece.pending.len(), 3);
        let first = piece.pending.pop().unwrap();
        assert_eq!(first, BlockInfo { piece_idx: 3, offset: 0, len: BLOCK_SIZE });
        let second = piece.pending.pop().unwrap();
        assert_eq!(second, BlockInfo { piece_idx: 3, offset: BLOCK_SIZE, len: BLOCK_SIZE });
        let tail = piece.pending.pop().unwrap();
        assert_eq!(tail, BlockInfo { piece_idx: 3, offset: 2 * BLOCK_SIZE, len: 0x1000 });
    }

    #[test]
    fn test_allowed_fast_set_shape() {
        let info_hash = [0xAA; 20];
        let ip: IpAddr = "80.4.4.200".parse().unwrap();

        let set = allowed_fast_set(&info_hash, ip, 1313, 10);
        assert_eq!(set.len(), 10);
        assert!(set.iter().all(|&idx| idx < 1313));
        let unique: HashSet<_> = set.iter().collect();
        assert_eq!(unique.len(), set.len());

        // Deterministic for the same peer, and the low v4 octet does not
        // matter.
        let neighbour: IpAddr = "80.4.4.1".parse().unwrap();
        assert_eq!(set, allowed_fast_set(&info_hash, neighbour, 1313, 10));

        // Capped by the piece count.
        assert_eq!(allowed_fast_set(&info_hash, ip, 2, 10).len(), 2);
        assert!(allowed_fast_set(&info_hash, ip, 0, 10).is_empty());
    }

    #[test]
    fn test_in_flight_completion() {
        let slice = PieceSlice { idx: 0, begin: 0, end: BLOCK_SIZE };
        let mut piece = InFlightPiece::new(slice);
        assert!(!piece.complete());
        piece.received = BLOCK_SIZE;
        assert!(piece.complete());
    }
}
