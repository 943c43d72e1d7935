use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};
use crate::info::FileSpan;
use super::Result;

// How much of a piece's on-disk bytes the startup presence scan reads.
const SAMPLE_LEN: usize = 4096;

// One file of the torrent with its buffered write queue. Writes are
// collected and flushed in a batch when the buffered total crosses the
// threshold, when the file's piece range completes, or on shutdown.
//
// Lock order: the group's state mutex is always taken before any file's
// inner mutex, never the other way round.
#[derive(Debug)]
pub struct FileStore {

    pub span: FileSpan,

    inner: Mutex<Inner>,

    flush_threshold: usize,

}

#[derive(Debug)]
struct Inner {

    handle: std::fs::File,

    // (file offset, bytes) pairs not yet on disk.
    pending: Vec<(u64, Vec<u8>)>,

    buffered: usize,

}

impl FileStore {

    // Opens (creating if absent) the file at its span's path under `dir`.
    pub fn open(dir: &Path, span: FileSpan, flush_threshold: usize) -> Result<Self> {
        let path = dir.join(&span.path);
        if let Some(parent) = path.parent() {
            if !parent.is_dir() {
                tracing::info!("creating sub-directory: {:?}", parent);
                std::fs::create_dir_all(parent)?;
            }
        }
        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        tracing::info!("opened file: {:?}", path);
        Ok(Self {
            span,
            inner: Mutex::new(Inner {
                handle,
                pending: Vec::new(),
                buffered: 0,
            }),
            flush_threshold,
        })
    }

    // Queues bytes at a file-relative offset, flushing if the buffer
    // crosses the threshold. The caller has already clamped the region
    // to this file's span.
    pub fn queue_write(&self, file_offset: u64, bytes: Vec<u8>) -> Result<()> {
        debug_assert!(file_offset as usize + bytes.len() <= self.span.len);
        let mut inner = self.inner.lock()?;
        inner.buffered += bytes.len();
        inner.pending.push((file_offset, bytes));
        if inner.buffered >= self.flush_threshold {
            tracing::debug!("write buffer threshold reached for {:?}", self.span.path);
            inner.flush()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock()?.flush()
    }

    // Reads exactly `buf.len()` bytes at a file-relative offset. Pending
    // writes are flushed first so reads observe every committed piece.
    pub fn read_exact_at(&self, file_offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.flush()?;
        inner.handle.seek(SeekFrom::Start(file_offset))?;
        inner.handle.read_exact(buf)?;
        Ok(())
    }

    // Startup heuristic: treat a piece region as plausibly downloaded if
    // a short prefix of it reads fully and contains any nonzero byte.
    // Cheap compared to hashing every piece of a resumed torrent.
    pub fn sample_region(&self, file_offset: u64, region_len: usize) -> Result<bool> {
        let mut buf = vec![0u8; region_len.min(SAMPLE_LEN)];
        let mut inner = self.inner.lock()?;
        inner.handle.seek(SeekFrom::Start(file_offset))?;
        match inner.handle.read_exact(&mut buf) {
            Ok(()) => Ok(buf.iter().any(|&b| b != 0)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Inner {

    fn flush(&mut self) -> Result<()> {
        for (offset, bytes) in self.pending.drain(..) {
            self.handle.seek(SeekFrom::Start(offset))?;
            self.handle.write_all(&bytes)?;
        }
        self.buffered = 0;
        Ok(())
    }
}
