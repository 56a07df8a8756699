//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`super::CoreCodec`], but care should be taken not
//! to discard the underlying receive and send buffers.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    error::Error, extensions::core::PSTR, peer::PeerId, torrent::InfoHash,
};

#[derive(Debug)]
pub struct HandshakeCodec;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
///
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. The
/// reserved field advertises which extensions each side supports. The peer
/// id is usually the client name and version.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(
        info_hash: impl Into<[u8; 20]>,
        peer_id: impl Into<[u8; 20]>,
    ) -> Self {
        let mut reserved = [0u8; 8];

        // bit 43 counting from the left: the extension protocol (BEP 10)
        reserved[5] |= 0x10;
        // bit 61: the fast extension (BEP 6)
        reserved[7] |= 0x04;

        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved,
            info_hash: InfoHash(info_hash.into()),
            peer_id: PeerId(peer_id.into()),
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }

    pub fn validate(&self, target: &Self) -> bool {
        if self.info_hash != target.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return false;
        }
        if target.pstr_len != 19 || target.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        true
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        debug_assert_eq!(pstr_len, 19);
        debug_assert_eq!(pstr, PSTR);

        buf.put_u8(pstr_len);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol string length without advancing the cursor
        let mut tmp_buf = Cursor::new(&buf);
        let pstr_len = tmp_buf.get_u8() as usize;
        if pstr_len != PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }

        // 1 length byte + protocol string + reserved + info hash + peer id
        let payload_len = pstr_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        if pstr != PSTR {
            return Err(Error::HandshakeInvalid);
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr,
            pstr_len: pstr_len as u8,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let info_hash = [5u8; 20];
        let peer_id = [7u8; 20];
        let our_handshake = Handshake::new(info_hash, peer_id);

        assert_eq!(our_handshake.pstr_len, 19);
        assert_eq!(our_handshake.pstr, PSTR);
        assert_eq!(our_handshake.peer_id.0, peer_id);
        assert_eq!(our_handshake.info_hash.0, info_hash);
        assert!(our_handshake.supports_extended());
        assert!(our_handshake.supports_fast());
        assert!(!our_handshake.supports_dht());
    }

    #[test]
    fn roundtrip() {
        let ours = Handshake::new([5u8; 20], [7u8; 20]);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(ours.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let theirs = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ours, theirs);
        assert!(ours.validate(&theirs));
    }

    #[test]
    fn bad_pstr() {
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        buf.extend_from_slice(&[0u8; 67]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }
}
