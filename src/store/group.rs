use std::{
    collections::HashSet,
    num::NonZeroUsize,
    ops::Range,
    path::Path,
    sync::{Arc, Mutex},
};
use crate::{info::{FileSpan, TorrentInfo}, p2p::crypto::sha1, Bitfield, ID};
use super::{file::FileStore, Result, StoreError};

// Cached whole pieces for serving uploads.
const READ_CACHE_PIECES: usize = 64;

// A piece handed to a connection for download: index plus the byte
// range it occupies in the torrent (the end is clamped for the last
// piece). Claimed by exactly one connection until committed or parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSlice {
    pub idx: usize,
    pub begin: usize,
    pub end: usize,
}

impl PieceSlice {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {

    // Verified and queued for disk.
    Written,

    // The piece was already present, nothing changed.
    AlreadyPresent,

    // Digest check failed, the bit stays unset.
    HashMismatch,
}

// Piece storage across the torrent's files. The bitmap, the in-flight
// claim set and the parked set are the only state shared between
// connections, all behind one mutex. Disk bytes live in the per-file
// stores; a piece spanning several files is split into one clamped
// write per file on commit.
#[derive(Debug)]
pub struct StoreGroup {

    info: TorrentInfo,

    piece_hashes: Vec<ID>,

    files: Vec<FileStore>,

    state: Mutex<State>,

    // Peers often read several blocks of the same piece, so whole
    // pieces are cached on first read.
    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,

}

#[derive(Debug)]
struct State {

    present: Bitfield,

    // Pieces currently owned by a connection.
    claimed: HashSet<usize>,

    // Pieces a connection failed on, sat out for one pick cycle so the
    // same piece is not immediately retried by the same peer.
    parked: HashSet<usize>,

}

impl StoreGroup {

    pub fn new(
        info: TorrentInfo,
        piece_hashes: Vec<ID>,
        spans: Vec<FileSpan>,
        dir: &Path,
        flush_threshold: usize,
    ) -> Result<Self> {
        debug_assert_eq!(piece_hashes.len(), info.num_pieces as usize);
        debug_assert!(!spans.is_empty());

        if !dir.is_dir() {
            std::fs::create_dir_all(dir)?;
            tracing::info!("created missing output directory: {:?}", dir);
        }
        let files = spans
            .into_iter()
            .map(|span| FileStore::open(dir, span, flush_threshold))
            .collect::<Result<Vec<_>>>()?;

        let group = Self {
            state: Mutex::new(State {
                present: Bitfield::repeat(false, info.num_pieces as usize),
                claimed: HashSet::new(),
                parked: HashSet::new(),
            }),
            read_cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(READ_CACHE_PIECES).unwrap(),
            )),
            info,
            piece_hashes,
            files,
        };
        group.scan_existing()?;
        Ok(group)
    }

    // Resumption heuristic: sample the prefix of each piece region on
    // disk and mark pieces whose every region looks written. Wrongly
    // marked pieces are caught later by peers re-requesting data that
    // fails their own checks; wrongly missed pieces are just fetched
    // again.
    fn scan_existing(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        for idx in 0..self.info.num_pieces as usize {
            let range = self.info.piece_byte_range(idx);
            let mut found = false;
            for (file, clamped) in self.overlapping(&range) {
                let file_offset = (clamped.start - file.span.offset) as u64;
                if !file.sample_region(file_offset, clamped.len())? {
                    found = false;
                    break;
                }
                found = true;
            }
            if found {
                state.present.set(idx, true);
            }
        }
        let have = state.present.count_ones();
        if have > 0 {
            tracing::info!("resumed with {}/{} pieces on disk", have, self.info.num_pieces);
        }
        Ok(())
    }

    // Files whose spans overlap the byte range, with the range clamped
    // to each span.
    fn overlapping<'a>(
        &'a self,
        range: &'a Range<usize>,
    ) -> impl Iterator<Item = (&'a FileStore, Range<usize>)> {
        self.files.iter().filter_map(move |file| {
            if !file.span.overlaps(range) {
                return None;
            }
            let span = file.span.byte_range();
            Some((file, range.start.max(span.start)..range.end.min(span.end)))
        })
    }

    // Chooses the lowest missing piece the peer has, skipping pieces
    // claimed by other connections and pieces parked since the last
    // cycle. `restrict` narrows the candidates (the allowed-fast set
    // while still choked). A returned piece is claimed by the caller
    // until commit or park.
    pub fn pick(
        &self,
        peer: &Bitfield,
        restrict: Option<&HashSet<usize>>,
    ) -> Result<Option<PieceSlice>> {
        let mut state = self.state.lock()?;
        let parked = std::mem::take(&mut state.parked);
        for idx in 0..self.info.num_pieces as usize {
            if state.present[idx]
                || !peer.get(idx).map(|b| *b).unwrap_or(false)
                || state.claimed.contains(&idx)
                || parked.contains(&idx)
            {
                continue;
            }
            if let Some(allowed) = restrict {
                if !allowed.contains(&idx) {
                    continue;
                }
            }
            state.claimed.insert(idx);
            let range = self.info.piece_byte_range(idx);
            return Ok(Some(PieceSlice { idx, begin: range.start, end: range.end }));
        }
        Ok(None)
    }

    // Verifies and queues the piece for disk. Splits the write per
    // overlapping file at clamped offsets. Expensive (digest over the
    // whole piece), callers run it off the async threads.
    pub fn commit(&self, idx: usize, data: &[u8]) -> Result<CommitOutcome> {
        if idx >= self.piece_hashes.len() {
            return Err(StoreError::PieceOutOfRange(idx));
        }
        debug_assert_eq!(data.len(), self.info.piece_length(idx));

        if sha1(&[data]) != self.piece_hashes[idx] {
            tracing::warn!("piece {} failed hash verification", idx);
            let mut state = self.state.lock()?;
            state.claimed.remove(&idx);
            return Ok(CommitOutcome::HashMismatch);
        }

        let mut state = self.state.lock()?;
        state.claimed.remove(&idx);
        if state.present[idx] {
            return Ok(CommitOutcome::AlreadyPresent);
        }

        let range = self.info.piece_byte_range(idx);
        for (file, clamped) in self.overlapping(&range) {
            let file_offset = (clamped.start - file.span.offset) as u64;
            let piece_range = (clamped.start - range.start)..(clamped.end - range.start);
            file.queue_write(file_offset, data[piece_range].to_vec())?;
        }
        state.present.set(idx, true);

        // Flush any file whose piece range just completed.
        for file in &self.files {
            let first = file.span.first_piece(self.info.piece_len);
            let last = file.span.last_piece(self.info.piece_len);
            if (first..=last).contains(&idx) && (first..=last).all(|p| state.present[p]) {
                tracing::debug!("file {:?} complete, flushing", file.span.path);
                file.flush()?;
            }
        }
        Ok(CommitOutcome::Written)
    }

    // Sets a failed piece aside for one pick cycle and releases its
    // claim so another connection can take it.
    pub fn park(&self, idx: usize) -> Result<()> {
        let mut state = self.state.lock()?;
        state.claimed.remove(&idx);
        state.parked.insert(idx);
        Ok(())
    }

    // Reads a block of a present piece, serving uploads. Whole pieces
    // are pulled through the cache.
    pub fn read_block(&self, idx: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
        {
            let state = self.state.lock()?;
            if idx >= self.info.num_pieces as usize {
                return Err(StoreError::PieceOutOfRange(idx));
            }
            if !state.present[idx] {
                return Err(StoreError::PieceNotPresent(idx));
            }
        }

        let piece = if let Some(piece) = self.read_cache.lock()?.get(&idx) {
            Arc::clone(piece)
        } else {
            let piece = Arc::new(self.read_piece(idx)?);
            self.read_cache.lock()?.put(idx, Arc::clone(&piece));
            piece
        };

        if offset + len > piece.len() {
            return Err(StoreError::IoSizeError {
                expected: piece.len(),
                actual: offset + len,
            });
        }
        Ok(piece[offset..offset + len].to_vec())
    }

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        let range = self.info.piece_byte_range(idx);
        let mut buf = vec![0u8; range.len()];
        for (file, clamped) in self.overlapping(&range) {
            let file_offset = (clamped.start - file.span.offset) as u64;
            let piece_range = (clamped.start - range.start)..(clamped.end - range.start);
            file.read_exact_at(file_offset, &mut buf[piece_range])?;
        }
        Ok(buf)
    }

    pub fn bitfield(&self) -> Result<Bitfield> {
        Ok(self.state.lock()?.present.clone())
    }

    pub fn has_piece(&self, idx: usize) -> Result<bool> {
        let state = self.state.lock()?;
        Ok(idx < self.info.num_pieces as usize && state.present[idx])
    }

    // Whether the peer has anything we lack.
    pub fn wants_any(&self, peer: &Bitfield) -> Result<bool> {
        let state = self.state.lock()?;
        Ok((0..self.info.num_pieces as usize)
            .any(|idx| !state.present[idx] && peer.get(idx).map(|b| *b).unwrap_or(false)))
    }

    pub fn num_downloaded(&self) -> Result<usize> {
        Ok(self.state.lock()?.present.count_ones())
    }

    pub fn is_complete(&self) -> Result<bool> {
        let state = self.state.lock()?;
        Ok(state.present.count_ones() == self.info.num_pieces as usize)
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn flush_all(&self) -> Result<()> {
        for file in &self.files {
            file.flush()?;
        }
        Ok(())
    }
}
