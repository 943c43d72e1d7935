// Metadata exchange. Lets a peer that only knows the info hash pull the
// info dict in 16 KiB pieces from peers that have it, and serve the same
// in return. The reassembled dict is only accepted once its digest
// matches the info hash.

use serde_derive::{Deserialize, Serialize};
use crate::{p2p::crypto::sha1, ID};
use super::{ExtensionError, Result};

pub const METADATA_PIECE_LEN: usize = 0x4000;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

// Wire form: a bencoded dict, followed by the raw piece bytes for data
// messages.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataDict {

    msg_type: i64,

    piece: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {

    pub fn encode(&self) -> Result<Vec<u8>> {
        let (dict, data) = match self {
            MetadataMessage::Request { piece } => (
                MetadataDict { msg_type: MSG_REQUEST, piece: *piece as i64, total_size: None },
                None,
            ),
            MetadataMessage::Data { piece, total_size, data } => (
                MetadataDict {
                    msg_type: MSG_DATA,
                    piece: *piece as i64,
                    total_size: Some(*total_size as i64),
                },
                Some(data),
            ),
            MetadataMessage::Reject { piece } => (
                MetadataDict { msg_type: MSG_REJECT, piece: *piece as i64, total_size: None },
                None,
            ),
        };
        let mut payload = serde_bencode::to_bytes(&dict)?;
        if let Some(data) = data {
            payload.extend_from_slice(data);
        }
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let dict_end = find_dict_end(payload)?;
        let dict: MetadataDict = serde_bencode::from_bytes(&payload[..dict_end])?;
        let piece = u32::try_from(dict.piece)
            .map_err(|_| ExtensionError::InvalidPayload("ut_metadata"))?;
        match dict.msg_type {
            MSG_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_DATA => {
                let total_size = dict
                    .total_size
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or(ExtensionError::InvalidPayload("ut_metadata"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload[dict_end..].to_vec(),
                })
            }
            MSG_REJECT => Ok(MetadataMessage::Reject { piece }),
            _ => Err(ExtensionError::InvalidPayload("ut_metadata")),
        }
    }
}

// Locates the end of the leading bencoded dict so the trailing raw
// piece bytes can be split off without decoding them.
fn find_dict_end(payload: &[u8]) -> Result<usize> {
    if payload.first() != Some(&b'd') {
        return Err(ExtensionError::InvalidPayload("ut_metadata"));
    }
    let mut depth = 0usize;
    let mut i = 0;
    while i < payload.len() {
        match payload[i] {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'e' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            b'i' => {
                while i < payload.len() && payload[i] != b'e' {
                    i += 1;
                }
                i += 1;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < payload.len() && payload[i] != b':' {
                    i += 1;
                }
                let len: usize = std::str::from_utf8(&payload[start..i])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ExtensionError::InvalidPayload("ut_metadata"))?;
                i += 1 + len;
            }
            _ => return Err(ExtensionError::InvalidPayload("ut_metadata")),
        }
    }
    Err(ExtensionError::InvalidPayload("ut_metadata"))
}

pub fn piece_count(total_size: usize) -> usize {
    (total_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
}

pub fn piece_len(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_LEN;
    total_size.saturating_sub(offset).min(METADATA_PIECE_LEN)
}

// Reassembly buffer for an info dict being fetched. Pieces may arrive
// from several peers in any order; the result is only surfaced once the
// digest of the whole matches the expected info hash.
#[derive(Debug)]
pub struct MetadataBuffer {
    total_size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataBuffer {

    pub fn new(total_size: usize) -> Self {
        Self {
            total_size,
            pieces: vec![None; piece_count(total_size)],
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    // Lowest missing piece index, None when all are in.
    pub fn next_request(&self) -> Option<u32> {
        self.pieces
            .iter()
            .position(|p| p.is_none())
            .map(|idx| idx as u32)
    }

    // Rejects pieces of the wrong length for their position.
    pub fn insert(&mut self, piece: u32, data: Vec<u8>) {
        let idx = piece as usize;
        if idx >= self.pieces.len() || data.len() != piece_len(piece, self.total_size) {
            return;
        }
        self.pieces[idx] = Some(data);
    }

    pub fn complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_some())
    }

    // Assembles and verifies. A digest mismatch clears the buffer so the
    // fetch restarts from scratch, some peer fed us garbage.
    pub fn try_assemble(&mut self, info_hash: &ID) -> Option<Vec<u8>> {
        if !self.complete() {
            return None;
        }
        let mut raw = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter().flatten() {
            raw.extend_from_slice(piece);
        }
        if sha1(&[&raw]) == *info_hash {
            Some(raw)
        } else {
            tracing::warn!("assembled metadata fails digest check, discarding");
            self.pieces.iter_mut().for_each(|p| *p = None);
            None
        }
    }
}
