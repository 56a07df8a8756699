//! Piece bitfields.
//!
//! Two representations live here: the raw wire [`Bitfield`] exchanged in
//! `Bitfield` messages, and [`PieceField`], the in-memory view of which
//! pieces a peer (or the client) has. `PieceField` keeps the two degenerate
//! cases compact so that a seed among thousands of pieces costs no
//! allocation and `HaveAll`/`HaveNone` handling is O(1).
use bitvec::prelude::*;

/// Raw bitfield where index = piece, as it appears on the wire.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during the handshake.
pub type Reserved = BitArray<[u8; 8], Msb0>;

/// The set of pieces a peer claims to have.
///
/// `All` and `None` are what `HaveAll`/`HaveNone` produce; `Sparse` is the
/// general case backed by a bit vector. The length is the torrent's piece
/// count when the metadata is known. Before that, `Have` messages may grow a
/// `Sparse` field past any bound, and the final range check happens when the
/// metadata arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum PieceField {
    None { len: usize },
    All { len: usize },
    Sparse(Bitfield),
}

impl Default for PieceField {
    fn default() -> Self {
        Self::None { len: 0 }
    }
}

impl PieceField {
    pub fn none(len: usize) -> Self {
        Self::None { len }
    }

    pub fn all(len: usize) -> Self {
        Self::All { len }
    }

    /// Build from a wire bitfield. When the piece count is known the raw bits
    /// are truncated to it; spare bits in the last byte are ignored.
    pub fn from_wire(mut raw: Bitfield, piece_count: Option<usize>) -> Self {
        if let Some(n) = piece_count {
            raw.resize(n, false);
        }
        if raw.not_any() {
            return Self::None { len: raw.len() };
        }
        if raw.all() {
            return Self::All { len: raw.len() };
        }
        Self::Sparse(raw)
    }

    /// The wire representation, padded to whole bytes.
    pub fn to_wire(&self) -> Bitfield {
        match self {
            Self::None { len } => BitVec::repeat(false, *len),
            Self::All { len } => BitVec::repeat(true, *len),
            Self::Sparse(bits) => bits.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::None { len } | Self::All { len } => *len,
            Self::Sparse(bits) => bits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, piece: usize) -> bool {
        match self {
            Self::None { .. } => false,
            Self::All { len } => piece < *len,
            Self::Sparse(bits) => bits.get(piece).map(|b| *b).unwrap_or(false),
        }
    }

    /// Number of pieces set.
    pub fn count(&self) -> usize {
        match self {
            Self::None { .. } => 0,
            Self::All { len } => *len,
            Self::Sparse(bits) => bits.count_ones(),
        }
    }

    /// True when every piece is set.
    pub fn is_all(&self) -> bool {
        self.len() > 0 && self.count() == self.len()
    }

    /// Set a piece, growing the field if the index lies past the current
    /// length. Growth only happens while the metadata is unknown.
    pub fn set(&mut self, piece: usize) {
        match self {
            Self::All { len } if piece < *len => {}
            Self::Sparse(bits) if piece < bits.len() => {
                bits.set(piece, true);
            }
            _ => {
                let mut bits = self.to_wire();
                if piece >= bits.len() {
                    bits.resize(piece + 1, false);
                }
                bits.set(piece, true);
                *self = Self::Sparse(bits);
            }
        }
    }

    pub fn set_all(&mut self) {
        *self = Self::All { len: self.len() };
    }

    pub fn set_none(&mut self) {
        *self = Self::None { len: self.len() };
    }

    /// Call `f` with every set piece index.
    pub fn for_each_set(&self, mut f: impl FnMut(usize)) {
        match self {
            Self::None { .. } => {}
            Self::All { len } => (0..*len).for_each(f),
            Self::Sparse(bits) => bits.iter_ones().for_each(|i| f(i)),
        }
    }

    /// Re-anchor the field to the real piece count once the metadata
    /// arrives. Returns false if the peer had claimed a piece outside the
    /// torrent, which is grounds for disconnecting it.
    pub fn rebase(&mut self, piece_count: usize) -> bool {
        match self {
            Self::None { len } => {
                *len = piece_count;
                true
            }
            Self::All { len } => {
                // an `All` built before the metadata was known carries the
                // wire length, which is only trustworthy if it fits
                let ok = *len <= piece_count.div_ceil(8) * 8;
                *len = piece_count;
                ok
            }
            Self::Sparse(bits) => {
                if bits.len() > piece_count {
                    let spare = &bits[piece_count..];
                    if spare.any() {
                        return false;
                    }
                }
                bits.resize(piece_count, false);
                true
            }
        }
    }

    pub fn progress(&self) -> f32 {
        if self.len() == 0 {
            return 0.0;
        }
        self.count() as f32 / self.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_states() {
        let mut f = PieceField::none(8);
        assert_eq!(f.count(), 0);
        assert!(!f.has(3));

        f.set(3);
        assert!(f.has(3));
        assert_eq!(f.count(), 1);

        f.set_all();
        assert!(f.has(7));
        assert_eq!(f.count(), 8);
        assert!(f.is_all());

        f.set_none();
        assert_eq!(f.count(), 0);
    }

    #[test]
    fn bitfield_after_have_all_wins() {
        // the last availability message decides the bit pattern
        let mut f = PieceField::all(4);
        let mut raw: Bitfield = BitVec::repeat(false, 8);
        raw.set(1, true);
        f = PieceField::from_wire(raw, Some(4));
        assert!(!f.has(0));
        assert!(f.has(1));
        assert_eq!(f.count(), 1);
    }

    #[test]
    fn grows_while_metadata_unknown() {
        let mut f = PieceField::none(0);
        f.set(100);
        assert!(f.has(100));
        assert!(f.len() >= 101);
    }

    #[test]
    fn rebase_rejects_out_of_range_claims() {
        let mut f = PieceField::none(0);
        f.set(9);
        // metadata says there are only 4 pieces
        assert!(!f.rebase(4));

        let mut ok = PieceField::none(0);
        ok.set(2);
        assert!(ok.rebase(4));
        assert_eq!(ok.len(), 4);
    }

    #[test]
    fn wire_roundtrip() {
        let mut f = PieceField::none(10);
        f.set(0);
        f.set(9);
        let wire = f.to_wire();
        let back = PieceField::from_wire(wire, Some(10));
        assert_eq!(back.count(), 2);
        assert!(back.has(0) && back.has(9));
    }
}
