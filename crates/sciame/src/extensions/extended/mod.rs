//! The extension protocol handshake (BEP 10).
//!
//! Right after the base handshake, peers that advertised the extension bit
//! exchange a bencoded dictionary describing which sub-protocols they speak
//! and under which message ids. Everything else in this crate's
//! `extensions` tree rides on the mapping negotiated here.

use std::net::Ipv6Addr;

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{AsString, SingleItemEncoder, ToBencode},
};

use crate::config::CONFIG;

/// The id of the extension handshake itself, fixed by BEP 10.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// Our locally-chosen id for ut_pex, advertised under `m`.
pub const UT_PEX_ID: u8 = 1;

/// Our locally-chosen id for ut_metadata, advertised under `m`.
pub const UT_METADATA_ID: u8 = 3;

/// How many outstanding requests we are willing to queue per peer.
pub const LOCAL_REQQ: u16 = 512;

/// A message of one of the negotiated sub-protocols. The const is the id
/// *we* advertise; ids the remote chose for itself live in its
/// [`Extension::m`].
pub trait ExtMsg {
    const ID: u8;
}

/// The payload of the extension-protocol handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extension {
    /// messages (supported extensions)
    pub m: M,

    /// whether the peer prefers encrypted connections
    pub e: Option<u8>,

    /// the port this peer listens on
    pub p: Option<u16>,

    /// a string identifying the client and the version
    pub v: Option<String>,

    /// number of outstanding request messages this client supports
    /// without dropping any
    pub reqq: Option<u16>,

    /// added by BEP 9: the size of the info-dictionary part of the
    /// metainfo file
    pub metadata_size: Option<u32>,

    /// the peer has the whole torrent and only uploads
    pub upload_only: Option<bool>,

    /// our ipv6 address as this peer sees it
    pub ipv6: Option<Ipv6Addr>,
}

/// Lists the sub-protocols a peer supports: symbolic name to the message id
/// that the peer picked for it. An id of zero disables the extension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct M {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub ut_holepunch: Option<u8>,
}

impl Extension {
    /// The handshake we send out: everything this engine speaks, plus the
    /// metadata size when we already hold the info dict of a public torrent.
    pub fn supported(
        metadata_size: Option<u32>,
        upload_only: bool,
        ipv6: Option<Ipv6Addr>,
    ) -> Self {
        Self {
            m: M {
                ut_metadata: Some(UT_METADATA_ID),
                ut_pex: Some(UT_PEX_ID),
                ut_holepunch: None,
            },
            e: Some(1),
            p: Some(CONFIG.local_peer_port),
            v: Some(format!("Sciame {}", env!("CARGO_PKG_VERSION"))),
            reqq: Some(LOCAL_REQQ),
            metadata_size,
            upload_only: Some(upload_only),
            ipv6,
        }
    }

    /// A peer that speaks ut_holepunch is reachable over uTP.
    pub fn supports_utp(&self) -> bool {
        self.m.ut_holepunch.is_some()
    }
}

impl ToBencode for M {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(ut_holepunch) = self.ut_holepunch {
                e.emit_pair(b"ut_holepunch", ut_holepunch)?;
            }
            if let Some(ut_metadata) = self.ut_metadata {
                e.emit_pair(b"ut_metadata", ut_metadata)?;
            }
            if let Some(ut_pex) = self.ut_pex {
                e.emit_pair(b"ut_pex", ut_pex)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for M {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut ut_metadata = None;
        let mut ut_pex = None;
        let mut ut_holepunch = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"ut_metadata", value) => {
                    ut_metadata = u8::decode_bencode_object(value)
                        .context("ut_metadata")
                        .map(Some)?;
                }
                (b"ut_pex", value) => {
                    ut_pex = u8::decode_bencode_object(value)
                        .context("ut_pex")
                        .map(Some)?;
                }
                (b"ut_holepunch", value) => {
                    ut_holepunch = u8::decode_bencode_object(value)
                        .context("ut_holepunch")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        // an id of zero means "disabled" on the wire
        Ok(Self {
            ut_metadata: ut_metadata.filter(|id| *id > 0),
            ut_pex: ut_pex.filter(|id| *id > 0),
            ut_holepunch: ut_holepunch.filter(|id| *id > 0),
        })
    }
}

impl ToBencode for Extension {
    const MAX_DEPTH: usize = 20;
    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(pref) = self.e {
                e.emit_pair(b"e", pref)?;
            }
            if let Some(ipv6) = &self.ipv6 {
                e.emit_pair(b"ipv6", AsString(ipv6.octets().as_slice()))?;
            }
            e.emit_pair(b"m", &self.m)?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(p) = self.p {
                e.emit_pair(b"p", p)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(upload_only) = self.upload_only {
                e.emit_pair(b"upload_only", upload_only as u8)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for Extension {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut m = M::default();
        let mut e = None;
        let mut p = None;
        let mut v = None;
        let mut reqq = None;
        let mut metadata_size = None;
        let mut upload_only = None;
        let mut ipv6 = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    m = M::decode_bencode_object(value).context("m")?;
                }
                (b"e", value) => {
                    e = u8::decode_bencode_object(value)
                        .context("e")
                        .map(Some)?;
                }
                (b"metadata_size", value) => {
                    metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"p", value) => {
                    p = u16::decode_bencode_object(value)
                        .context("p")
                        .map(Some)?;
                }
                (b"reqq", value) => {
                    reqq = u16::decode_bencode_object(value)
                        .context("reqq")
                        .map(Some)?;
                }
                (b"upload_only", value) => {
                    upload_only = u8::decode_bencode_object(value)
                        .context("upload_only")
                        .map(|n| Some(n != 0))?;
                }
                (b"ipv6", value) => {
                    let AsString(bytes) =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("ipv6")?;
                    if bytes.len() == 16 {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&bytes);
                        ipv6 = Some(Ipv6Addr::from(octets));
                    }
                }
                _ => {}
            }
        }

        Ok(Self { m, e, p, v, reqq, metadata_size, upload_only, ipv6 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let ours = Extension::supported(Some(5205), false, None);

        let bytes = ours.to_bencode().unwrap();
        let theirs = Extension::from_bencode(&bytes).unwrap();

        assert_eq!(ours, theirs);
        assert_eq!(theirs.m.ut_metadata, Some(UT_METADATA_ID));
        assert_eq!(theirs.m.ut_pex, Some(UT_PEX_ID));
        assert_eq!(theirs.reqq, Some(LOCAL_REQQ));
        assert_eq!(theirs.metadata_size, Some(5205));
        assert!(!theirs.supports_utp());
    }

    #[test]
    fn holepunch_implies_utp() {
        let raw = b"d1:md12:ut_holepunchi4e11:ut_metadatai3eee";
        let ext = Extension::from_bencode(raw).unwrap();
        assert!(ext.supports_utp());
        assert_eq!(ext.m.ut_metadata, Some(3));
        assert_eq!(ext.m.ut_pex, None);
    }

    #[test]
    fn zero_id_disables_an_extension() {
        let raw = b"d1:md11:ut_metadatai0e6:ut_pexi2eee";
        let ext = Extension::from_bencode(raw).unwrap();
        assert_eq!(ext.m.ut_metadata, None);
        assert_eq!(ext.m.ut_pex, Some(2));
    }

    // should transform a byte array into an Extension
    #[test]
    fn from_bytes_to_extension() {
        let bytes = [
            100, 49, 58, 101, 105, 49, 101, 49, 58, 109, 100, 49, 49, 58, 117,
            116, 95, 109, 101, 116, 97, 100, 97, 116, 97, 105, 51, 101, 54,
            58, 117, 116, 95, 112, 101, 120, 105, 49, 101, 101, 49, 51, 58,
            109, 101, 116, 97, 100, 97, 116, 97, 95, 115, 105, 122, 101, 105,
            53, 50, 48, 53, 101, 49, 58, 112, 105, 53, 49, 52, 49, 51, 101,
            52, 58, 114, 101, 113, 113, 105, 53, 49, 50, 101, 49, 49, 58, 117,
            112, 108, 111, 97, 100, 95, 111, 110, 108, 121, 105, 49, 101, 49,
            58, 118, 49, 55, 58, 84, 114, 97, 110, 115, 109, 105, 115, 115,
            105, 111, 110, 32, 50, 46, 57, 52, 101,
        ];

        let ext = Extension::from_bencode(&bytes).unwrap();

        assert_eq!(ext.e, Some(1));
        assert_eq!(ext.m.ut_metadata, Some(3));
        assert_eq!(ext.m.ut_pex, Some(1));
        assert_eq!(ext.metadata_size, Some(5205));
        assert_eq!(ext.p, Some(51413));
        assert_eq!(ext.reqq, Some(512));
        assert_eq!(ext.upload_only, Some(true));
        assert_eq!(ext.v, Some("Transmission 2.94".to_owned()));
    }
}
