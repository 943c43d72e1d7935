// Small resumable readers used by the obfuscation handshake. Input
// arrives with arbitrary chunking, so both keep an explicit cursor and
// pick up where they left off instead of re-scanning from zero.

use bytes::{Buf, BytesMut};

pub enum ScanOutcome {
    // Pattern ends at the returned offset (exclusive) in the buffer.
    Found(usize),
    NotYet,
    // No match within the allowed window.
    LimitExceeded,
}

// Searches an accumulating buffer for a fixed byte pattern. The buffer
// must only grow between calls; `examined` marks how far previous calls
// got, minus the overlap a match straddling two chunks would need.
pub struct StreamScanner {
    pattern: Vec<u8>,
    examined: usize,
    limit: usize,
}

impl StreamScanner {

    // `limit` bounds how far into the stream the pattern may end.
    pub fn new(pattern: Vec<u8>, limit: usize) -> Self {
        debug_assert!(!pattern.is_empty());
        Self {
            pattern,
            examined: 0,
            limit,
        }
    }

    pub fn scan(&mut self, buf: &[u8]) -> ScanOutcome {
        let start = self.examined.saturating_sub(self.pattern.len() - 1);

        if let Some(at) = buf[start..]
            .windows(self.pattern.len())
            .position(|w| w == self.pattern)
        {
            let end = start + at + self.pattern.len();
            if end > self.limit {
                return ScanOutcome::LimitExceeded;
            }
            return ScanOutcome::Found(end);
        }

        self.examined = buf.len();
        if buf.len() >= self.limit {
            ScanOutcome::LimitExceeded
        } else {
            ScanOutcome::NotYet
        }
    }
}

// Reads one `(u16 length, length bytes)` sequence spread across any
// number of buffer arrivals, retaining partial state in between.
#[derive(Default)]
pub struct PadReader {
    len: Option<usize>,
    collected: Vec<u8>,
}

impl PadReader {

    pub fn new() -> Self {
        Self::default()
    }

    // How many more bytes the reader can consume right now. Callers that
    // transform the stream in place (decryption) use this to transform
    // exactly what will be taken.
    pub fn needed(&self) -> usize {
        match self.len {
            None => 2,
            Some(len) => len - self.collected.len(),
        }
    }

    // The length prefix once it has been parsed, for callers that bound
    // what they will accept.
    pub fn declared(&self) -> Option<usize> {
        self.len
    }

    // Consumes from the front of `src`. Returns the reassembled padding
    // once the full sequence has arrived, None if more input is needed.
    pub fn read_from(&mut self, src: &mut BytesMut) -> Option<Vec<u8>> {
        loop {
            match self.len {
                None => {
                    if src.len() < 2 {
                        return None;
                    }
                    self.len = Some(src.get_u16() as usize);
                }
                Some(len) => {
                    let take = (len - self.collected.len()).min(src.len());
                    self.collected.extend_from_slice(&src[..take]);
                    src.advance(take);
                    if self.collected.len() == len {
                        return Some(std::mem::take(&mut self.collected));
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_scanner_chunked_match() {
        let mut scanner = StreamScanner::new(b"needle".to_vec(), 64);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"some hay and a nee");
        assert!(matches!(scanner.scan(&buf), ScanOutcome::NotYet));

        // Pattern completes across the chunk boundary.
        buf.extend_from_slice(b"dle trailing");
        match scanner.scan(&buf) {
            ScanOutcome::Found(end) => assert_eq!(&buf[end - 6..end], b"needle"),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_scanner_single_byte_arrivals() {
        let pattern = b"\x01\x02\x01\x02\x03";
        let stream = b"\x01\x02\x01\x02\x01\x02\x03";
        let mut scanner = StreamScanner::new(pattern.to_vec(), 32);
        let mut buf = BytesMut::new();
        let mut found = None;
        for byte in stream {
            buf.put_u8(*byte);
            if let ScanOutcome::Found(end) = scanner.scan(&buf) {
                found = Some(end);
                break;
            }
        }
        assert_eq!(found, Some(stream.len()));
    }

    #[test]
    fn test_scanner_limit() {
        let mut scanner = StreamScanner::new(b"xy".to_vec(), 8);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(scanner.scan(&buf), ScanOutcome::LimitExceeded));

        // A match ending past the limit is rejected too.
        let mut scanner = StreamScanner::new(b"xy".to_vec(), 8);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"0000000xy");
        assert!(matches!(scanner.scan(&buf), ScanOutcome::LimitExceeded));
    }

    // Padding reassembles identically no matter how the input is cut up.
    #[test]
    fn test_pad_reader_chunk_invariance() {
        for pad_len in [0usize, 1, 7, 255, 512] {
            let pad: Vec<u8> = (0..pad_len).map(|i| (i % 251) as u8).collect();
            let mut wire = BytesMut::new();
            wire.put_u16(pad_len as u16);
            wire.extend_from_slice(&pad);

            for chunk_size in [1usize, 2, 3, 100, 600] {
                let mut reader = PadReader::new();
                let mut buf = BytesMut::new();
                let mut out = None;
                let mut rest = wire.clone();
                while out.is_none() {
                    let take = chunk_size.min(rest.len());
                    buf.extend_from_slice(&rest.split_to(take));
                    out = reader.read_from(&mut buf);
                    if rest.is_empty() && out.is_none() {
                        out = reader.read_from(&mut buf);
                        break;
                    }
                }
                assert_eq!(out.expect("pad incomplete"), pad, "len {} chunk {}", pad_len, chunk_size);
            }
        }
    }

    #[test]
    fn test_pad_reader_leaves_trailing_bytes() {
        let mut reader = PadReader::new();
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.extend_from_slice(b"padEXTRA");
        let pad = reader.read_from(&mut buf).unwrap();
        assert_eq!(pad, b"pad");
        assert_eq!(&buf[..], b"EXTRA");
    }
}
