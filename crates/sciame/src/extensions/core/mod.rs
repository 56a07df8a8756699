//! The peer wire protocol: messages exchanged between peers after the
//! handshake, prefixed by a 4-byte big-endian length.

mod codec;
mod handshake_codec;

// re-exports
pub use codec::*;
pub use handshake_codec::*;

use bytes::Bytes;

/// The block length that virtually all clients use. Some clients drop the
/// connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String (PSTR)
/// Bytes of the string "BitTorrent protocol". Used during handshake.
pub const PSTR: [u8; 19] = [
    66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112, 114, 111, 116,
    111, 99, 111, 108,
];

/// A Block is a subset of a Piece, pieces are subsets of the entire torrent
/// data.
///
/// When peers send data to us, they send blocks, on the "Piece" message of
/// the wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: u32,

    /// The block's data, 16 KiB except possibly at the end of a piece.
    pub block: Bytes,
}

impl Block {
    #[inline]
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index as u32,
            begin: self.begin,
            len: self.block.len() as u32,
        }
    }
}

/// The representation of a [`Block`] without its payload, exchanged in
/// `Request`, `Cancel` and `Reject` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,

    /// The zero-based byte offset into the piece.
    pub begin: u32,

    /// The block's length in bytes, <= 16 KiB.
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    /// Like most clients, we only accept blocks of at most 16 KiB that start
    /// on a block boundary.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len <= BLOCK_LEN && self.begin % BLOCK_LEN == 0
    }
}
