//! The metadata exchange protocol (BEP 9).
//!
//! While a torrent started from a magnet link has no info dictionary yet,
//! peers advertising `ut_metadata` serve it in 16 KiB pieces. Each message
//! is a small bencoded dictionary; a data message carries the raw metadata
//! bytes appended after the dictionary.

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{SingleItemEncoder, ToBencode},
};

use super::{core::BLOCK_LEN, extended::ExtMsg, UT_METADATA_ID};
use crate::error::Error;

/// How many metadata piece requests from a single peer we keep queued.
pub const METADATA_REQQ: usize = 64;

/// The dictionary at the head of every metadata message.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u32>,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl TryFrom<u8> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MetadataMsgType::*;
        match value {
            v if v == Request as u8 => Ok(Request),
            v if v == Data as u8 => Ok(Data),
            v if v == Reject as u8 => Ok(Reject),
            _ => Err(Error::BencodeError),
        }
    }
}

/// A parsed metadata message: the dictionary plus, for data messages, the
/// metadata piece payload that follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMsg {
    Request(u32),
    Data(Metadata, Vec<u8>),
    Reject(u32),
}

impl ExtMsg for MetadataMsg {
    const ID: u8 = UT_METADATA_ID;
}

impl MetadataMsg {
    /// Parse the bencoded dictionary and split off a data message's payload.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        // the dictionary always ends at the first "ee" (its only nested
        // tokens are integers)
        let dict_end = buf
            .windows(2)
            .position(|w| w == b"ee")
            .map(|i| i + 2)
            .ok_or(Error::BencodeError)?;

        let metadata = Metadata::from_bencode(&buf[..dict_end])?;

        Ok(match metadata.msg_type {
            MetadataMsgType::Request => Self::Request(metadata.piece),
            MetadataMsgType::Reject => Self::Reject(metadata.piece),
            MetadataMsgType::Data => {
                Self::Data(metadata, buf[dict_end..].to_vec())
            }
        })
    }
}

impl Metadata {
    pub fn request(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Request, piece, total_size: None }
    }

    pub fn reject(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Reject, piece, total_size: None }
    }

    /// Build the wire payload of a data message: the dictionary followed by
    /// the raw bytes of the requested metadata piece.
    pub fn data(piece: u32, total_size: u32, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let metadata = Self {
            msg_type: MetadataMsgType::Data,
            piece,
            total_size: Some(total_size),
        };

        let mut bytes = metadata.to_bencode()?;
        bytes.extend_from_slice(payload);

        Ok(bytes)
    }

    /// How many 16 KiB pieces a metadata blob of `total_size` bytes has.
    pub fn piece_count(total_size: u32) -> u32 {
        total_size.div_ceil(BLOCK_LEN)
    }

    /// Byte range of a metadata piece inside the full blob.
    pub fn piece_range(total_size: u32, piece: u32) -> Option<std::ops::Range<usize>> {
        let start = piece.checked_mul(BLOCK_LEN)?;
        if start >= total_size {
            return None;
        }
        let end = (start + BLOCK_LEN).min(total_size);
        Some(start as usize..end as usize)
    }
}

impl ToBencode for Metadata {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type as u8)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl FromBencode for Metadata {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut msg_type = 0;
        let mut piece = 0;
        let mut total_size = None;

        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"msg_type", value) => {
                    msg_type =
                        u8::decode_bencode_object(value).context("msg_type")?;
                }
                (b"piece", value) => {
                    piece =
                        u32::decode_bencode_object(value).context("piece")?;
                }
                (b"total_size", value) => {
                    total_size = u32::decode_bencode_object(value)
                        .context("total_size")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let msg_type = msg_type
            .try_into()
            .map_err(|_| decoding::Error::missing_field("msg_type"))?;

        Ok(Self { msg_type, piece, total_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_dict() {
        let bytes = Metadata::request(0).to_bencode().unwrap();
        assert_eq!(bytes, b"d8:msg_typei0e5:piecei0ee");

        match MetadataMsg::parse(&bytes).unwrap() {
            MetadataMsg::Request(piece) => assert_eq!(piece, 0),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn data_splits_dict_and_payload() {
        let info = vec![7u8; 100];
        let bytes = Metadata::data(1, 100, &info).unwrap();

        match MetadataMsg::parse(&bytes).unwrap() {
            MetadataMsg::Data(metadata, payload) => {
                assert_eq!(metadata.piece, 1);
                assert_eq!(metadata.total_size, Some(100));
                assert_eq!(payload, info);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn reject_roundtrip() {
        let bytes = Metadata::reject(9).to_bencode().unwrap();
        match MetadataMsg::parse(&bytes).unwrap() {
            MetadataMsg::Reject(piece) => assert_eq!(piece, 9),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn piece_math() {
        assert_eq!(Metadata::piece_count(1), 1);
        assert_eq!(Metadata::piece_count(BLOCK_LEN), 1);
        assert_eq!(Metadata::piece_count(BLOCK_LEN + 1), 2);

        assert_eq!(Metadata::piece_range(100, 0), Some(0..100));
        assert_eq!(
            Metadata::piece_range(BLOCK_LEN + 5, 1),
            Some(BLOCK_LEN as usize..BLOCK_LEN as usize + 5)
        );
        assert_eq!(Metadata::piece_range(100, 1), None);
    }
}
