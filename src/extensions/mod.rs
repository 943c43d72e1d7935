// Extension sub-protocols negotiated over the extended handshake
// (message id 20). Each side assigns its own numeric ids in the `m`
// dict; inbound frames carry our ids, outbound frames must carry the
// remote's.

use std::collections::BTreeMap;
use serde_derive::{Deserialize, Serialize};

pub mod holepunch;
pub mod metadata;
pub mod pex;

use self::{holepunch::HolepunchMessage, metadata::MetadataMessage, pex::PexMessage};

type Result<T, E = ExtensionError> = std::result::Result<T, E>;

// Id 0 is reserved for the extended handshake itself.
pub const HANDSHAKE_ID: u8 = 0;

// Ids we advertise for inbound traffic.
pub const UT_PEX_ID: u8 = 1;
pub const UT_METADATA_ID: u8 = 2;
pub const UT_HOLEPUNCH_ID: u8 = 3;
pub const LT_DONTHAVE_ID: u8 = 4;
pub const UPLOAD_ONLY_ID: u8 = 5;

#[derive(thiserror::Error, Debug)]
pub enum ExtensionError {

    #[error("bencode: {0}")]
    Bencode(String),

    #[error("unknown extension id: {0}")]
    UnknownId(u8),

    #[error("invalid {0} payload")]
    InvalidPayload(&'static str),
}

impl From<serde_bencode::Error> for ExtensionError {
    fn from(e: serde_bencode::Error) -> Self {
        ExtensionError::Bencode(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedHandshake {

    // Extension name to message id. Id 0 withdraws an extension.
    #[serde(default)]
    pub m: BTreeMap<String, u8>,

    // Local listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,

    // Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,

    // Number of outstanding requests the sender is willing to queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,

    // Non-zero when the sender has everything and only uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_only: Option<i64>,
}

impl ExtendedHandshake {

    // The handshake we send, advertising every sub-protocol we speak.
    pub fn ours(listen_port: u16, metadata_size: Option<usize>, seed: bool) -> Self {
        let mut m = BTreeMap::new();
        m.insert("ut_pex".into(), UT_PEX_ID);
        m.insert("ut_metadata".into(), UT_METADATA_ID);
        m.insert("ut_holepunch".into(), UT_HOLEPUNCH_ID);
        m.insert("lt_donthave".into(), LT_DONTHAVE_ID);
        m.insert("upload_only".into(), UPLOAD_ONLY_ID);
        Self {
            m,
            p: Some(listen_port),
            v: Some(concat!("peerwire ", env!("CARGO_PKG_VERSION")).into()),
            metadata_size: metadata_size.map(|n| n as i64),
            reqq: Some(250),
            upload_only: seed.then_some(1),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(payload)?)
    }
}

// What the remote declared in its extended handshake. Outbound frames
// use these ids; a None means the sub-protocol is off for this peer.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub pex: Option<u8>,
    pub metadata: Option<u8>,
    pub holepunch: Option<u8>,
    pub dont_have: Option<u8>,
    pub upload_only: Option<u8>,
    pub metadata_size: Option<usize>,
    pub reqq: Option<usize>,
}

impl From<&ExtendedHandshake> for Capabilities {
    fn from(hs: &ExtendedHandshake) -> Self {
        let id = |name: &str| hs.m.get(name).copied().filter(|&id| id != 0);
        Self {
            pex: id("ut_pex"),
            metadata: id("ut_metadata"),
            holepunch: id("ut_holepunch"),
            dont_have: id("lt_donthave"),
            upload_only: id("upload_only"),
            metadata_size: hs.metadata_size.and_then(|n| usize::try_from(n).ok()),
            reqq: hs.reqq.and_then(|n| usize::try_from(n).ok()),
        }
    }
}

pub enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    Pex(PexMessage),
    Metadata(MetadataMessage),
    Holepunch(HolepunchMessage),
    DontHave { idx: u32 },
    UploadOnly(bool),
}

impl ExtendedMessage {

    // Decodes an inbound frame by the id we advertised for it.
    pub fn decode(id: u8, payload: &[u8]) -> Result<Self> {
        match id {
            HANDSHAKE_ID => Ok(Self::Handshake(ExtendedHandshake::decode(payload)?)),
            UT_PEX_ID => Ok(Self::Pex(PexMessage::decode(payload)?)),
            UT_METADATA_ID => Ok(Self::Metadata(MetadataMessage::decode(payload)?)),
            UT_HOLEPUNCH_ID => Ok(Self::Holepunch(HolepunchMessage::decode(payload)?)),
            LT_DONTHAVE_ID => {
                let bytes: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| ExtensionError::InvalidPayload("lt_donthave"))?;
                Ok(Self::DontHave { idx: u32::from_be_bytes(bytes) })
            }
            UPLOAD_ONLY_ID => match payload {
                [flag] => Ok(Self::UploadOnly(*flag != 0)),
                _ => Err(ExtensionError::InvalidPayload("upload_only")),
            },
            id => Err(ExtensionError::UnknownId(id)),
        }
    }

    // Payload bytes only, the caller frames them under the remote's id.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Handshake(hs) => hs.encode(),
            Self::Pex(pex) => pex.encode(),
            Self::Metadata(msg) => msg.encode(),
            Self::Holepunch(msg) => Ok(msg.encode()),
            Self::DontHave { idx } => Ok(idx.to_be_bytes().to_vec()),
            Self::UploadOnly(seed) => Ok(vec![*seed as u8]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_handshake_round_trip() {
        let ours = ExtendedHandshake::ours(6881, Some(31337), false);
        let decoded = ExtendedHandshake::decode(&ours.encode().unwrap()).unwrap();
        assert_eq!(decoded.p, Some(6881));
        assert_eq!(decoded.metadata_size, Some(31337));
        assert_eq!(decoded.m.get("ut_pex"), Some(&UT_PEX_ID));
        assert_eq!(decoded.upload_only, None);

        let caps = Capabilities::from(&decoded);
        assert_eq!(caps.pex, Some(UT_PEX_ID));
        assert_eq!(caps.metadata_size, Some(31337));
    }

    #[test]
    fn test_capabilities_zero_id_withdraws() {
        let mut hs = ExtendedHandshake::default();
        hs.m.insert("ut_pex".into(), 0);
        let caps = Capabilities::from(&hs);
        assert_eq!(caps.pex, None);
    }

    // Handshakes from other clients carry fields we don't model.
    #[test]
    fn test_foreign_handshake_fields_ignored() {
        let raw = b"d1:md6:ut_pexi1e11:ut_metadatai2ee1:pi51413e4:reqqi500e6:yourip4:\x7f\x00\x00\x01e";
        let hs = ExtendedHandshake::decode(raw).unwrap();
        assert_eq!(hs.p, Some(51413));
        assert_eq!(hs.reqq, Some(500));
        assert_eq!(hs.m.get("ut_metadata"), Some(&2));
    }

    #[test]
    fn test_dont_have_round_trip() {
        let payload = ExtendedMessage::DontHave { idx: 42 }.encode().unwrap();
        match ExtendedMessage::decode(LT_DONTHAVE_ID, &payload).unwrap() {
            ExtendedMessage::DontHave { idx } => assert_eq!(idx, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(matches!(
            ExtendedMessage::decode(99, &[]),
            Err(ExtensionError::UnknownId(99))
        ));
    }
}
