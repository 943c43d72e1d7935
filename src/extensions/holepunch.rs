// NAT traversal relay messages. A peer behind a firewall asks a mutual
// peer (the relay) to rendezvous with a target; the relay sends connect
// to both ends so they dial each other simultaneously.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::{Buf, BufMut, BytesMut};
use super::{ExtensionError, Result};

const TYPE_RENDEZVOUS: u8 = 0x00;
const TYPE_CONNECT: u8 = 0x01;
const TYPE_ERROR: u8 = 0x02;

const ADDR_V4: u8 = 0x00;
const ADDR_V6: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HolepunchErrorCode {

    // The target is not in the relay's swarm.
    NoSuchPeer = 0x01,

    // The relay knows the target but has no connection to it.
    NotConnected = 0x02,

    // The target never declared holepunch support.
    NoSupport = 0x03,

    // Rendezvous addressed to the relay itself.
    NoSelf = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolepunchMessage {

    // Initiator -> relay: please introduce me to this address.
    Rendezvous { target: SocketAddr },

    // Relay -> both ends: dial this address now.
    Connect { target: SocketAddr },

    // Relay -> initiator: rendezvous failed.
    Error { target: SocketAddr, code: u32 },
}

impl HolepunchMessage {

    pub fn error(target: SocketAddr, code: HolepunchErrorCode) -> Self {
        HolepunchMessage::Error { target, code: code as u32 }
    }

    pub fn target(&self) -> SocketAddr {
        match self {
            HolepunchMessage::Rendezvous { target }
            | HolepunchMessage::Connect { target }
            | HolepunchMessage::Error { target, .. } => *target,
        }
    }

    // type ‖ addr family ‖ address ‖ port ‖ error code
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, target, code) = match self {
            HolepunchMessage::Rendezvous { target } => (TYPE_RENDEZVOUS, target, 0),
            HolepunchMessage::Connect { target } => (TYPE_CONNECT, target, 0),
            HolepunchMessage::Error { target, code } => (TYPE_ERROR, target, *code),
        };
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(msg_type);
        match target.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDR_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDR_V6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(target.port());
        buf.put_u32(code);
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if buf.len() < 12 {
            return Err(ExtensionError::InvalidPayload("ut_holepunch"));
        }
        let msg_type = buf.get_u8();
        let ip = match buf.get_u8() {
            ADDR_V4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDR_V6 => {
                if buf.len() < 22 {
                    return Err(ExtensionError::InvalidPayload("ut_holepunch"));
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(ExtensionError::InvalidPayload("ut_holepunch")),
        };
        let target = SocketAddr::new(ip, buf.get_u16());
        let code = buf.get_u32();
        match msg_type {
            TYPE_RENDEZVOUS => Ok(HolepunchMessage::Rendezvous { target }),
            TYPE_CONNECT => Ok(HolepunchMessage::Connect { target }),
            TYPE_ERROR => Ok(HolepunchMessage::Error { target, code }),
            _ => Err(ExtensionError::InvalidPayload("ut_holepunch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_v4_round_trip() {
        let target = SocketAddr::new(Ipv4Addr::new(192, 168, 1, 1).into(), 6881);
        let msg = HolepunchMessage::Rendezvous { target };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 12);
        assert_eq!(HolepunchMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_connect_v6_round_trip() {
        let target = SocketAddr::new(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10).into(),
            51413,
        );
        let msg = HolepunchMessage::Connect { target };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 24);
        assert_eq!(HolepunchMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_error_round_trip() {
        let target = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 1);
        let msg = HolepunchMessage::error(target, HolepunchErrorCode::NotConnected);
        let decoded = HolepunchMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(HolepunchMessage::decode(&[TYPE_CONNECT, ADDR_V4, 1, 2]).is_err());
        // v6 flag with a v4-sized body.
        let target = SocketAddr::new(Ipv4Addr::new(1, 2, 3, 4).into(), 80);
        let mut encoded = HolepunchMessage::Connect { target }.encode();
        encoded[1] = ADDR_V6;
        assert!(HolepunchMessage::decode(&encoded).is_err());
    }
}
