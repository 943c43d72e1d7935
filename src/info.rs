use std::{ops::Range, path::PathBuf};

// A file's claim on the torrent's logical piece space.
#[derive(Debug, Clone)]
pub struct FileSpan {

    // Path relative to the output directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub len: usize,

    // Offset in bytes from start of torrent when viewed as a single array.
    pub offset: usize,

}

impl FileSpan {

    // Byte index range for the whole torrent, half open.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.len)
    }

    pub fn first_piece(&self, piece_len: usize) -> usize {
        self.offset / piece_len
    }

    // Inclusive index of the last piece this file touches.
    pub fn last_piece(&self, piece_len: usize) -> usize {
        debug_assert!(self.len > 0);
        (self.offset + self.len - 1) / piece_len
    }

    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        self.offset < range.end && range.start < self.offset + self.len
    }
}

// Immutable torrent geometry, cheap to clone.
#[derive(Debug, Clone)]
pub struct TorrentInfo {

    pub total_len: u64,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub num_pieces: u32,

}

impl TorrentInfo {

    pub fn new(total_len: u64, piece_len: usize) -> Self {
        let num_pieces = ((total_len + piece_len as u64 - 1) / piece_len as u64) as u32;
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
        }
    }

    // Returns length of piece given its index, the last piece is clamped
    // to the end of the torrent.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, idx: usize) -> usize {
        idx * self.piece_len
    }

    // Byte range a piece occupies within the torrent.
    pub fn piece_byte_range(&self, idx: usize) -> Range<usize> {
        let begin = self.piece_byte_offset(idx);
        begin..(begin + self.piece_length(idx))
    }
}
