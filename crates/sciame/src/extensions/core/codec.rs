use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
#[cfg(test)]
use bytes::Bytes;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{Block, BlockInfo, BLOCK_LEN};
use crate::{bitfield::Bitfield, error::Error};

/// An extended-protocol frame: the negotiated extension id followed by its
/// opaque payload. Payloads are bencoded dictionaries, except for the raw
/// metadata bytes a `ut_metadata` data message appends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl ExtendedMessage {
    pub fn ext_id(&self) -> u8 {
        self.0
    }
    pub fn payload(&self) -> &[u8] {
        &self.1
    }
}

impl From<ExtendedMessage> for Core {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Messages exchanged after a successful handshake: the vanilla protocol
/// plus the Fast Extension (BEP 6) and the extension protocol frame
/// (BEP 10).
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
    Suggest(usize),
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast(usize),
    Extended(ExtendedMessage),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for CoreId {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Port as u8 => Ok(Port),
            k if k == Suggest as u8 => Ok(Suggest),
            k if k == HaveAll as u8 => Ok(HaveAll),
            k if k == HaveNone as u8 => Ok(HaveNone),
            k if k == Reject as u8 => Ok(Reject),
            k if k == AllowedFast as u8 => Ok(AllowedFast),
            k if k == Extended as u8 => Ok(Extended),
            _ => Err(Error::MessageId(k)),
        }
    }
}

/// The most bytes a `Bitfield` frame may carry. Anything larger than this is
/// treated as a protocol violation even before we know the piece count.
const MAX_BITFIELD_BYTES: usize = 0x10_0000;

#[derive(Debug, Clone)]
pub struct CoreCodec;

impl CoreCodec {
    /// Validate a frame length against the fixed shape of its message id.
    /// Runs as soon as the length prefix and id are buffered, before the
    /// body arrives, so oversized frames fail fast.
    fn validate_len(id: CoreId, msg_len: usize) -> Result<(), Error> {
        use CoreId::*;
        let ok = match id {
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => msg_len == 1,
            Have | Suggest | AllowedFast => msg_len == 5,
            Request | Cancel | Reject => msg_len == 13,
            Port => msg_len == 3,
            Piece => msg_len > 9 && msg_len <= 9 + BLOCK_LEN as usize,
            Extended => msg_len >= 2,
            Bitfield => msg_len >= 1 && msg_len <= 1 + MAX_BITFIELD_BYTES,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::MessageLength { id: id as u8, len: msg_len })
        }
    }
}

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Core::KeepAlive => {
                buf.put_u32(0);
            }
            Core::Choke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Choke as u8);
            }
            Core::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Unchoke as u8);
            }
            Core::Interested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Interested as u8);
            }
            Core::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::NotInterested as u8);
            }
            Core::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(CoreId::HaveAll as u8);
            }
            Core::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(CoreId::HaveNone as u8);
            }
            Core::Have(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(CoreId::Have as u8);
                buf.put_u32(to_wire_index(piece_index)?);
            }
            Core::Suggest(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(CoreId::Suggest as u8);
                buf.put_u32(to_wire_index(piece_index)?);
            }
            Core::AllowedFast(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(CoreId::AllowedFast as u8);
                buf.put_u32(to_wire_index(piece_index)?);
            }
            Core::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(CoreId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Core::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(CoreId::Request as u8);
                put_block_info(buf, &block);
            }
            Core::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(CoreId::Cancel as u8);
                put_block_info(buf, &block);
            }
            Core::Reject(block) => {
                buf.put_u32(13);
                buf.put_u8(CoreId::Reject as u8);
                put_block_info(buf, &block);
            }
            // <len=0009+X><id=7><index><begin><block>
            Core::Piece(block) => {
                let Block { index, begin, block } = block;
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(CoreId::Piece as u8);
                buf.put_u32(to_wire_index(index)?);
                buf.put_u32(begin);
                buf.extend_from_slice(&block);
            }
            // <len=0003><id=9><listen-port>
            Core::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(CoreId::Port as u8);
                buf.put_u16(port);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Core::Extended(extended_msg) => {
                let payload = extended_msg.payload();
                buf.put_u32(payload.len() as u32 + 2);
                buf.put_u8(CoreId::Extended as u8);
                buf.put_u8(extended_msg.ext_id());
                buf.extend_from_slice(payload);
            }
        }
        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without advancing the buffer cursor, we may not
        // have the full message yet
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32() as usize;

        // the message length is only 0 if this is a keep alive message (all
        // other message types have at least one more field, the message id)
        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Core::KeepAlive));
        }

        if buf.remaining() < 5 {
            return Ok(None);
        }

        // the id is known before the body, validate the length against it
        // right away so a bogus frame never makes us buffer its body
        let msg_id = CoreId::try_from(buf[4])?;
        Self::validate_len(msg_id, msg_len)?;

        if buf.remaining() < 4 + msg_len {
            trace!(
                "read buffer is {} bytes long but message is {} bytes long",
                buf.remaining(),
                msg_len
            );
            return Ok(None);
        }

        // we have the full message in the buffer, advance past length and id
        buf.advance(5);

        let msg = match msg_id {
            CoreId::Choke => Core::Choke,
            CoreId::Unchoke => Core::Unchoke,
            CoreId::Interested => Core::Interested,
            CoreId::NotInterested => Core::NotInterested,
            CoreId::HaveAll => Core::HaveAll,
            CoreId::HaveNone => Core::HaveNone,
            // <len=0005><id=4><piece index>
            CoreId::Have => Core::Have(buf.get_u32() as usize),
            CoreId::Suggest => Core::Suggest(buf.get_u32() as usize),
            CoreId::AllowedFast => Core::AllowedFast(buf.get_u32() as usize),
            // <len=0001+X><id=5><bitfield>
            CoreId::Bitfield => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Core::Bitfield(Bitfield::from_vec(bitfield))
            }
            CoreId::Request => Core::Request(get_block_info(buf)),
            CoreId::Cancel => Core::Cancel(get_block_info(buf)),
            CoreId::Reject => Core::Reject(get_block_info(buf)),
            // <len=0009+X><id=7><index><begin><block>
            CoreId::Piece => {
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let block = buf.copy_to_bytes(msg_len - 9);
                Core::Piece(Block { index, begin, block })
            }
            CoreId::Port => Core::Port(buf.get_u16()),
            CoreId::Extended => {
                let ext_id = buf.get_u8();
                let mut payload = vec![0u8; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Core::Extended(ExtendedMessage(ext_id, payload))
            }
        };

        Ok(Some(msg))
    }
}

fn put_block_info(buf: &mut BytesMut, block: &BlockInfo) {
    buf.put_u32(block.index);
    buf.put_u32(block.begin);
    buf.put_u32(block.len);
}

fn get_block_info(buf: &mut BytesMut) -> BlockInfo {
    let index = buf.get_u32();
    let begin = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo { index, begin, len }
}

fn to_wire_index(index: usize) -> Result<u32, Error> {
    index.try_into().map_err(|_| Error::BlockOutOfRange)
}
