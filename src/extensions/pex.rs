// Peer exchange. Peers gossip swarm membership as deltas: compact
// addresses added since the last message, one flag byte each, and
// addresses dropped. v4 and v6 travel in separate fields.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};
use bytes::{BufMut, BytesMut};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use super::Result;

pub const FLAG_ENCRYPTION: u8 = 0x01;
pub const FLAG_SEED: u8 = 0x02;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PexDict {

    #[serde(default, skip_serializing_if = "Option::is_none")]
    added: Option<ByteBuf>,

    #[serde(rename = "added.f", default, skip_serializing_if = "Option::is_none")]
    added_f: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    added6: Option<ByteBuf>,

    #[serde(rename = "added6.f", default, skip_serializing_if = "Option::is_none")]
    added6_f: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    dropped: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    dropped6: Option<ByteBuf>,
}

#[derive(Debug, Default)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct PexMessage {
    pub added: Vec<(SocketAddr, u8)>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut added = BytesMut::new();
        let mut added_f = BytesMut::new();
        let mut added6 = BytesMut::new();
        let mut added6_f = BytesMut::new();
        for (addr, flags) in &self.added {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    added.put_slice(&ip.octets());
                    added.put_u16(addr.port());
                    added_f.put_u8(*flags);
                }
                IpAddr::V6(ip) => {
                    added6.put_slice(&ip.octets());
                    added6.put_u16(addr.port());
                    added6_f.put_u8(*flags);
                }
            }
        }
        let mut dropped = BytesMut::new();
        let mut dropped6 = BytesMut::new();
        for addr in &self.dropped {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    dropped.put_slice(&ip.octets());
                    dropped.put_u16(addr.port());
                }
                IpAddr::V6(ip) => {
                    dropped6.put_slice(&ip.octets());
                    dropped6.put_u16(addr.port());
                }
            }
        }

        let field = |buf: BytesMut| (!buf.is_empty()).then(|| ByteBuf::from(buf.to_vec()));
        let dict = PexDict {
            added: field(added),
            added_f: field(added_f),
            added6: field(added6),
            added6_f: field(added6_f),
            dropped: field(dropped),
            dropped6: field(dropped6),
        };
        Ok(serde_bencode::to_bytes(&dict)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let dict: PexDict = serde_bencode::from_bytes(payload)?;
        let mut msg = PexMessage::default();

        if let Some(added) = &dict.added {
            let flags = dict.added_f.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
            for (i, entry) in added.chunks_exact(6).enumerate() {
                let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                let flag = flags.get(i).copied().unwrap_or(0);
                msg.added.push((SocketAddr::new(ip.into(), port), flag));
            }
        }
        if let Some(added6) = &dict.added6 {
            let flags = dict.added6_f.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
            for (i, entry) in added6.chunks_exact(18).enumerate() {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&entry[..16]);
                let port = u16::from_be_bytes([entry[16], entry[17]]);
                let flag = flags.get(i).copied().unwrap_or(0);
                msg.added
                    .push((SocketAddr::new(Ipv6Addr::from(octets).into(), port), flag));
            }
        }
        if let Some(dropped) = &dict.dropped {
            for entry in dropped.chunks_exact(6) {
                let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                msg.dropped.push(SocketAddr::new(ip.into(), port));
            }
        }
        if let Some(dropped6) = &dict.dropped6 {
            for entry in dropped6.chunks_exact(18) {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&entry[..16]);
                let port = u16::from_be_bytes([entry[16], entry[17]]);
                msg.dropped.push(SocketAddr::new(Ipv6Addr::from(octets).into(), port));
            }
        }
        Ok(msg)
    }
}

// Tracks what a single peer has been told so each message is a delta
// against the previous one.
#[derive(Debug, Default)]
pub struct PexState {
    sent: HashSet<SocketAddr>,
}

impl PexState {

    // Builds the next delta from a swarm snapshot of (address, is seed).
    // The peer's own address should be excluded by the caller.
    pub fn delta(&mut self, snapshot: &[(SocketAddr, bool)]) -> PexMessage {
        let current: HashSet<SocketAddr> = snapshot.iter().map(|(addr, _)| *addr).collect();
        let mut msg = PexMessage::default();
        for (addr, seed) in snapshot {
            if !self.sent.contains(addr) {
                let flags = if *seed { FLAG_SEED } else { 0 };
                msg.added.push((*addr, flags));
            }
        }
        for addr in self.sent.difference(&current) {
            msg.dropped.push(*addr);
        }
        self.sent = current;
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(10, 0, 0, a).into(), port)
    }

    #[test]
    fn test_pex_round_trip_mixed_families() {
        let v6 = SocketAddr::new(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).into(),
            6881,
        );
        let msg = PexMessage {
            added: vec![(v4(1, 6881), FLAG_SEED), (v6, FLAG_ENCRYPTION)],
            dropped: vec![v4(2, 51413)],
        };
        let decoded = PexMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_pex_empty_message() {
        let msg = PexMessage::default();
        assert!(msg.is_empty());
        let decoded = PexMessage::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_pex_state_deltas() {
        let mut state = PexState::default();

        let first = state.delta(&[(v4(1, 1000), false), (v4(2, 1000), true)]);
        assert_eq!(first.added.len(), 2);
        assert!(first.dropped.is_empty());

        // Unchanged snapshot produces an empty delta.
        let second = state.delta(&[(v4(1, 1000), false), (v4(2, 1000), true)]);
        assert!(second.is_empty());

        // One leaves, one joins.
        let third = state.delta(&[(v4(2, 1000), true), (v4(3, 1000), false)]);
        assert_eq!(third.added, vec![(v4(3, 1000), 0)]);
        assert_eq!(third.dropped, vec![v4(1, 1000)]);
    }
}
