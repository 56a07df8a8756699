//! Block scheduling: which block to ask which peer for next.
//!
//! The picker owns three tightly coupled structures: the replication map
//! (how many connected peers advertise each piece), the weighted piece list
//! (wanted, incomplete pieces ordered by how urgently they should finish),
//! and the request ledger (every outstanding block request with its peer
//! and timestamp). Rarest-first ordering, endgame racing, and the timed
//! cancellation sweep all live here.

use std::{net::SocketAddr, time::Duration};

use bitvec::prelude::*;
use hashbrown::HashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    bitfield::{Bitfield, PieceField},
    extensions::{BlockInfo, BLOCK_LEN},
    torrent::Layout,
};

/// Outstanding requests older than this get cancelled on the upkeep sweep.
pub const REQUEST_TTL: Duration = Duration::from_secs(120);

/// A piece we still want, carrying its share of the scheduling state.
#[derive(Debug, Clone, Copy)]
struct WeightedPiece {
    index: u32,
    /// Random tie-breaker so equal-weight pieces order differently across
    /// runs but stably within one.
    salt: u16,
    /// Outstanding ledger entries whose block lies in this piece.
    request_count: u32,
}

/// One outstanding block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRequest {
    /// Global block index, the primary sort key of the ledger.
    pub block: u64,
    pub peer: SocketAddr,
    pub sent_at: Instant,
}

/// The lifecycle of the piece list. Weight order is the steady state;
/// bulk availability changes drop back to `Unsorted` and the next walk
/// re-sorts once.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SortState {
    Unsorted,
    ByWeight,
}

#[derive(Debug)]
pub struct Picker {
    layout: Layout,

    /// Pieces still wanted and incomplete.
    pieces: Vec<WeightedPiece>,
    sort: SortState,

    /// Per piece, how many connected peers advertise it.
    replication: Vec<u16>,

    /// Every outstanding request, sorted by (block, peer).
    requests: Vec<ActiveRequest>,

    /// Received blocks of in-progress pieces.
    blocks_done: HashMap<u32, Bitfield>,

    /// Pieces we have, completed and verified.
    have: PieceField,

    /// Per-piece priority, 0 meaning never download.
    priorities: Option<Vec<u8>>,

    /// Non-zero while endgame racing is allowed: the pending-request bar a
    /// peer must clear to request an already-requested block.
    endgame_factor: u32,
}

impl Picker {
    pub fn new(
        layout: Layout,
        have: PieceField,
        priorities: Option<Vec<u8>>,
    ) -> Self {
        let mut rng = rand::rng();
        let mut pieces = Vec::new();

        for index in 0..layout.piece_count {
            if have.has(index) {
                continue;
            }
            let priority = priorities
                .as_ref()
                .and_then(|p| p.get(index).copied())
                .unwrap_or(1);
            if priority == 0 {
                continue;
            }
            pieces.push(WeightedPiece {
                index: index as u32,
                salt: rng.random(),
                request_count: 0,
            });
        }

        Self {
            layout,
            pieces,
            sort: SortState::Unsorted,
            replication: vec![0; layout.piece_count],
            requests: Vec::new(),
            blocks_done: HashMap::new(),
            have,
            priorities,
            endgame_factor: 0,
        }
    }

    pub fn have(&self) -> &PieceField {
        &self.have
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn pending_for(&self, peer: &SocketAddr) -> usize {
        self.requests.iter().filter(|r| r.peer == *peer).count()
    }

    pub fn in_endgame(&self) -> bool {
        self.endgame_factor > 0
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.is_empty() && self.blocks_done.is_empty()
    }

    /// Whether the peer advertises any piece we still want.
    pub fn peer_is_interesting(&self, peer_have: &PieceField) -> bool {
        self.pieces.iter().any(|wp| peer_have.has(wp.index as usize))
    }

    // -- replication map --------------------------------------------------

    pub fn replication(&self, piece: usize) -> u16 {
        self.replication.get(piece).copied().unwrap_or(0)
    }

    /// A single `Have`: bump one piece and rebalance just that piece.
    pub fn inc_replication(&mut self, piece: usize) {
        if let Some(r) = self.replication.get_mut(piece) {
            *r = r.saturating_add(1);
            self.rebalance(piece as u32);
        }
    }

    /// A bitfield-sized change invalidates the sort instead of rebalancing
    /// piece by piece.
    pub fn add_replication(&mut self, field: &PieceField) {
        field.for_each_set(|piece| {
            if let Some(r) = self.replication.get_mut(piece) {
                *r = r.saturating_add(1);
            }
        });
        self.sort = SortState::Unsorted;
    }

    pub fn sub_replication(&mut self, field: &PieceField) {
        field.for_each_set(|piece| {
            if let Some(r) = self.replication.get_mut(piece) {
                *r = r.saturating_sub(1);
            }
        });
        self.sort = SortState::Unsorted;
    }

    /// A wholesale bitfield replacement: out with the old view, in with the
    /// new one.
    pub fn replace_replication(
        &mut self,
        old: &PieceField,
        new: &PieceField,
    ) {
        self.sub_replication(old);
        self.add_replication(new);
    }

    /// Debug-only invariant: the stored replication equals a re-derivation
    /// from the connected peers. Misbehaving peers (duplicate bitfields)
    /// may violate it in production, which is accepted drift.
    pub fn assert_replication<'a>(
        &self,
        peer_fields: impl Iterator<Item = &'a PieceField>,
    ) {
        if cfg!(debug_assertions) {
            let mut derived = vec![0u16; self.layout.piece_count];
            for field in peer_fields {
                field.for_each_set(|piece| {
                    if let Some(r) = derived.get_mut(piece) {
                        *r += 1;
                    }
                });
            }
            debug_assert_eq!(derived, self.replication);
        }
    }

    // -- weighted ordering ------------------------------------------------

    fn blocks_done_in(&self, piece: u32) -> u32 {
        self.blocks_done
            .get(&piece)
            .map(|b| b.count_ones() as u32)
            .unwrap_or(0)
    }

    fn block_is_done(&self, piece: u32, nth: u32) -> bool {
        self.blocks_done
            .get(&piece)
            .map(|b| b.get(nth as usize).map(|x| *x).unwrap_or(false))
            .unwrap_or(false)
    }

    /// The compound key of the piece ordering: fewest blocks left to
    /// request, then higher priority, then rarest, then salt. Pieces with
    /// more pending requests than missing blocks sink to the back.
    fn weight(&self, wp: &WeightedPiece) -> (u32, u8, u16, u16) {
        let missing = self.layout.blocks_in_piece(wp.index as usize)
            - self.blocks_done_in(wp.index);
        let pending = wp.request_count;

        let urgency = if missing > pending {
            missing - pending
        } else {
            self.layout.blocks_per_piece() + pending
        };

        let priority = self
            .priorities
            .as_ref()
            .and_then(|p| p.get(wp.index as usize).copied())
            .unwrap_or(1);

        (
            urgency,
            u8::MAX - priority,
            self.replication[wp.index as usize],
            wp.salt,
        )
    }

    fn sort_by_weight(&mut self) {
        let mut pieces = std::mem::take(&mut self.pieces);
        pieces.sort_unstable_by_key(|wp| self.weight(wp));
        self.pieces = pieces;
        self.sort = SortState::ByWeight;
    }

    /// Re-position one piece after its weight changed, binary-searching the
    /// new slot instead of re-sorting the whole list.
    fn rebalance(&mut self, piece: u32) {
        if self.sort != SortState::ByWeight {
            return;
        }
        let Some(pos) = self.pieces.iter().position(|wp| wp.index == piece)
        else {
            return;
        };
        let wp = self.pieces.remove(pos);
        let key = self.weight(&wp);
        let at = self.pieces.partition_point(|other| self.weight(other) < key);
        self.pieces.insert(at, wp);
    }

    // -- the ledger -------------------------------------------------------

    fn ledger_pos(&self, block: u64, peer: &SocketAddr) -> Result<usize, usize> {
        self.requests.binary_search_by(|r| {
            r.block.cmp(&block).then_with(|| r.peer.cmp(peer))
        })
    }

    /// All peers currently holding a request for this block.
    fn requesters_of(&self, block: u64) -> Vec<SocketAddr> {
        let start = self.requests.partition_point(|r| r.block < block);
        self.requests[start..]
            .iter()
            .take_while(|r| r.block == block)
            .map(|r| r.peer)
            .collect()
    }

    /// Remove one (block, peer) entry. Idempotent: a second cancellation of
    /// the same block finds nothing and changes nothing. The ledger entry,
    /// the piece's request count, and the weight position all update
    /// together.
    pub fn remove_request(
        &mut self,
        info: &BlockInfo,
        peer: &SocketAddr,
    ) -> bool {
        let block = self.layout.block_index(info);
        match self.ledger_pos(block, peer) {
            Ok(pos) => {
                self.requests.remove(pos);
                self.dec_request_count(info.index);
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every request held by a departing peer, so its blocks become
    /// requestable again.
    pub fn remove_peer(&mut self, peer: &SocketAddr) -> usize {
        let layout = self.layout;
        let mut dropped = Vec::new();
        self.requests.retain(|r| {
            if r.peer == *peer {
                dropped.push(r.block);
                false
            } else {
                true
            }
        });
        let n = dropped.len();
        for block in dropped {
            let piece = (block / layout.blocks_per_piece() as u64) as u32;
            self.dec_request_count(piece);
        }
        n
    }

    fn dec_request_count(&mut self, piece: u32) {
        if let Some(wp) =
            self.pieces.iter_mut().find(|wp| wp.index == piece)
        {
            wp.request_count = wp.request_count.saturating_sub(1);
            self.rebalance(piece);
        }
    }

    fn inc_request_count(&mut self, piece: u32) {
        if let Some(wp) =
            self.pieces.iter_mut().find(|wp| wp.index == piece)
        {
            wp.request_count += 1;
            self.rebalance(piece);
        }
    }

    // -- request selection ------------------------------------------------

    /// Re-evaluate endgame: it starts when the outstanding requests could
    /// cover everything still missing, and ends (resetting the factor) when
    /// they no longer do.
    pub fn update_endgame(&mut self, active_downloaders: usize) {
        let missing_blocks: u64 = self
            .pieces
            .iter()
            .map(|wp| {
                (self.layout.blocks_in_piece(wp.index as usize)
                    - self.blocks_done_in(wp.index)) as u64
            })
            .sum();

        let outstanding = self.requests.len() as u64;
        let bytes_left = missing_blocks * BLOCK_LEN as u64;
        let covered = outstanding * BLOCK_LEN as u64 >= bytes_left;

        if covered && bytes_left > 0 {
            if self.endgame_factor == 0 {
                self.endgame_factor = (outstanding
                    / active_downloaders.max(1) as u64)
                    .max(1) as u32;
                debug!(
                    "entering endgame, factor {}",
                    self.endgame_factor
                );
            }
        } else {
            self.endgame_factor = 0;
        }
    }

    /// Pick up to `numwant` blocks for a peer: walk the pieces in weight
    /// order, take blocks we neither have nor requested, and during endgame
    /// race blocks that have exactly one other requester. Ledger entries
    /// are created here; the caller only has to put the requests on the
    /// wire.
    pub fn assign(
        &mut self,
        peer: SocketAddr,
        peer_have: &PieceField,
        numwant: usize,
    ) -> Vec<BlockInfo> {
        if numwant == 0 || self.pieces.is_empty() {
            return Vec::new();
        }

        if self.sort != SortState::ByWeight {
            self.sort_by_weight();
        }

        let peer_pending = self.pending_for(&peer);
        let now = Instant::now();
        let mut picked: Vec<BlockInfo> = Vec::new();
        let order: Vec<u32> =
            self.pieces.iter().map(|wp| wp.index).collect();

        'pieces: for piece in order {
            if !peer_have.has(piece as usize) {
                continue;
            }

            for nth in 0..self.layout.blocks_in_piece(piece as usize) {
                if picked.len() >= numwant {
                    break 'pieces;
                }
                if self.block_is_done(piece, nth) {
                    continue;
                }

                let info = self.layout.block_info(piece as usize, nth);
                let block = self.layout.block_index(&info);
                let requesters = self.requesters_of(block);

                if !requesters.is_empty() {
                    // someone is already on it; only endgame racing with a
                    // deep enough pipeline may double up, and never more
                    // than two requesters per block
                    let remaining = numwant - picked.len();
                    let allowed = self.endgame_factor > 0
                        && requesters.len() == 1
                        && requesters[0] != peer
                        && (peer_pending + picked.len() + remaining)
                            >= self.endgame_factor as usize;
                    if !allowed {
                        continue;
                    }
                }

                let pos = match self.ledger_pos(block, &peer) {
                    // already requested from this very peer
                    Ok(_) => continue,
                    Err(pos) => pos,
                };
                self.requests.insert(
                    pos,
                    ActiveRequest { block, peer, sent_at: now },
                );
                picked.push(info);
                self.inc_request_count(piece);
            }
        }

        trace!("assigned {} blocks to {peer}", picked.len());
        picked
    }

    // -- completions ------------------------------------------------------

    /// A block arrived from `from`. Returns None when the block was not
    /// needed (already done); otherwise the other peers whose duplicate
    /// requests should be cancelled, plus whether the piece just finished.
    pub fn block_received(
        &mut self,
        from: &SocketAddr,
        info: &BlockInfo,
    ) -> Option<(Vec<SocketAddr>, bool)> {
        let piece = info.index;
        let nth = info.begin / BLOCK_LEN;
        let block = self.layout.block_index(info);

        // drop this peer's own ledger entry either way
        self.remove_request(info, from);

        if self.have.has(piece as usize) || self.block_is_done(piece, nth) {
            return None;
        }

        let blocks_in_piece =
            self.layout.blocks_in_piece(piece as usize) as usize;
        let done = self
            .blocks_done
            .entry(piece)
            .or_insert_with(|| BitVec::repeat(false, blocks_in_piece));
        done.set(nth as usize, true);
        let piece_done = done.all();

        // during endgame other peers may be racing this block
        let others = self.requesters_of(block);
        for other in &others {
            self.remove_request(info, other);
        }

        if piece_done {
            self.pieces.retain(|wp| wp.index != piece);
        } else {
            self.rebalance(piece);
        }

        Some((others, piece_done))
    }

    /// The cache verified a completed piece.
    pub fn piece_checked_ok(&mut self, piece: usize) {
        self.blocks_done.remove(&(piece as u32));
        self.have.set(piece);
    }

    /// The piece failed its checksum: forget its blocks and put it back on
    /// the menu.
    pub fn piece_failed(&mut self, piece: usize) {
        self.blocks_done.remove(&(piece as u32));
        let mut rng = rand::rng();
        if !self.pieces.iter().any(|wp| wp.index == piece as u32) {
            self.pieces.push(WeightedPiece {
                index: piece as u32,
                salt: rng.random(),
                request_count: 0,
            });
            self.sort = SortState::Unsorted;
        }
    }

    /// The upkeep sweep: cancel requests older than [`REQUEST_TTL`] unless
    /// the peer is in the middle of delivering ("skip" decides). Returns
    /// the cancels to put on the wire.
    pub fn timed_cancel(
        &mut self,
        now: Instant,
        skip: impl Fn(&SocketAddr) -> bool,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let layout = self.layout;
        let mut cancelled = Vec::new();

        self.requests.retain(|r| {
            let too_old = now.duration_since(r.sent_at) >= REQUEST_TTL;
            if too_old && !skip(&r.peer) {
                let bpp = layout.blocks_per_piece() as u64;
                let piece = (r.block / bpp) as usize;
                let nth = (r.block % bpp) as u32;
                cancelled.push((r.peer, layout.block_info(piece, nth)));
                false
            } else {
                true
            }
        });

        for (_, info) in &cancelled {
            self.dec_request_count(info.index);
        }

        cancelled
    }

    /// Invariant checks used by tests: every piece's request count matches
    /// the ledger, and the ledger is sorted.
    #[cfg(test)]
    fn check_invariants(&self) {
        for wp in &self.pieces {
            let bpp = self.layout.blocks_per_piece() as u64;
            let n = self
                .requests
                .iter()
                .filter(|r| (r.block / bpp) as u32 == wp.index)
                .count();
            assert_eq!(
                n, wp.request_count as usize,
                "request_count drifted for piece {}",
                wp.index
            );
        }
        assert!(self
            .requests
            .windows(2)
            .all(|w| (w[0].block, w[0].peer) < (w[1].block, w[1].peer)));
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    /// 4 pieces of one 16 KiB block each.
    fn small_layout() -> Layout {
        Layout {
            piece_count: 4,
            piece_len: BLOCK_LEN,
            total_len: 4 * BLOCK_LEN as u64,
        }
    }

    fn field_with(pieces: &[usize], len: usize) -> PieceField {
        let mut f = PieceField::none(len);
        for p in pieces {
            f.set(*p);
        }
        f
    }

    #[test]
    fn rarest_first_with_two_peers() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);

        let a = addr(1);
        let b = addr(2);
        let a_have = field_with(&[0, 1], 4);
        let b_have = field_with(&[1, 2, 3], 4);

        picker.add_replication(&a_have);
        picker.add_replication(&b_have);

        // piece 0 is unique to A, pieces 2 and 3 unique to B, piece 1 tied
        let got_a = picker.assign(a, &a_have, 4);
        picker.check_invariants();
        assert_eq!(got_a.len(), 2);
        // the unique-rarest piece 0 comes before the twice-replicated 1
        assert_eq!(got_a[0].index, 0);
        assert_eq!(got_a[1].index, 1);

        let got_b = picker.assign(b, &b_have, 4);
        picker.check_invariants();
        // piece 1 is already requested from A, so B gets 2 and 3
        let mut idx: Vec<u32> = got_b.iter().map(|i| i.index).collect();
        idx.sort_unstable();
        assert_eq!(idx, vec![2, 3]);
    }

    #[test]
    fn endgame_crossover() {
        // 1 piece of 2 blocks
        let layout = Layout {
            piece_count: 1,
            piece_len: 2 * BLOCK_LEN,
            total_len: 2 * BLOCK_LEN as u64,
        };
        let mut picker =
            Picker::new(layout, PieceField::none(1), None);
        let everything = field_with(&[0], 1);

        let a = addr(1);
        picker.add_replication(&everything);
        let got = picker.assign(a, &everything, 2);
        assert_eq!(got.len(), 2);

        // one block arrives, one stays outstanding: 1 request covering
        // 1 missing block means endgame
        picker.block_received(&a, &layout.block_info(0, 0));
        picker.update_endgame(1);
        assert!(picker.in_endgame());

        // a second peer with a deep enough pipeline may race the block
        let b = addr(2);
        picker.add_replication(&everything);
        let got_b = picker.assign(b, &everything, 2);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_b[0], layout.block_info(0, 1));

        // a third requester is refused, two per block is the cap
        let c = addr(3);
        picker.add_replication(&everything);
        let got_c = picker.assign(c, &everything, 2);
        assert!(got_c.is_empty());

        picker.check_invariants();
    }

    #[test]
    fn no_duplicates_outside_endgame() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);
        let everything = field_with(&[0, 1, 2, 3], 4);

        let a = addr(1);
        let b = addr(2);
        picker.add_replication(&everything);
        picker.add_replication(&everything);

        let got_a = picker.assign(a, &everything, 2);
        assert_eq!(got_a.len(), 2);

        let got_b = picker.assign(b, &everything, 8);
        // B gets the two pieces A didn't take, nothing doubled
        assert_eq!(got_b.len(), 2);
        let mut all: Vec<u32> = got_a
            .iter()
            .chain(got_b.iter())
            .map(|i| i.index)
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn block_received_finishes_piece_and_cancels_racers() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);
        let everything = field_with(&[0, 1, 2, 3], 4);

        let a = addr(1);
        picker.add_replication(&everything);
        let got = picker.assign(a, &everything, 1);
        let info = got[0];

        let (others, piece_done) =
            picker.block_received(&a, &info).unwrap();
        assert!(others.is_empty());
        assert!(piece_done);
        assert_eq!(picker.outstanding_requests(), 0);

        // a duplicate completion is not credited
        assert!(picker.block_received(&a, &info).is_none());
        picker.check_invariants();
    }

    #[test]
    fn cancelling_twice_removes_exactly_one_entry() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);
        let everything = field_with(&[0, 1, 2, 3], 4);

        let a = addr(1);
        picker.add_replication(&everything);
        let got = picker.assign(a, &everything, 1);
        assert_eq!(picker.outstanding_requests(), 1);

        assert!(picker.remove_request(&got[0], &a));
        assert!(!picker.remove_request(&got[0], &a));
        assert_eq!(picker.outstanding_requests(), 0);
        picker.check_invariants();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_cancellation() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);
        let everything = field_with(&[0, 1, 2, 3], 4);

        let a = addr(1);
        picker.add_replication(&everything);
        let got = picker.assign(a, &everything, 1);
        assert_eq!(got.len(), 1);

        // at 121 s the request is overdue
        tokio::time::advance(Duration::from_secs(121)).await;

        // a peer that is mid-delivery is skipped
        let kept = picker.timed_cancel(Instant::now(), |_| true);
        assert!(kept.is_empty());
        assert_eq!(picker.outstanding_requests(), 1);

        let cancelled = picker.timed_cancel(Instant::now(), |_| false);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].0, a);
        assert_eq!(cancelled[0].1, got[0]);
        assert_eq!(picker.outstanding_requests(), 0);
        picker.check_invariants();
    }

    #[test]
    fn failed_piece_comes_back() {
        let layout = small_layout();
        let mut picker =
            Picker::new(layout, PieceField::none(4), None);
        let everything = field_with(&[0, 1, 2, 3], 4);
        let a = addr(1);
        picker.add_replication(&everything);

        let got = picker.assign(a, &everything, 1);
        let info = got[0];
        let (_, piece_done) = picker.block_received(&a, &info).unwrap();
        assert!(piece_done);

        picker.piece_failed(info.index as usize);
        let again = picker.assign(a, &everything, 4);
        assert!(again.contains(&info));
        picker.check_invariants();
    }

    #[test]
    fn priorities_order_pieces() {
        let layout = small_layout();
        // piece 3 is high priority, piece 1 is do-not-download
        let priorities = vec![1u8, 0, 1, 9];
        let mut picker = Picker::new(
            layout,
            PieceField::none(4),
            Some(priorities),
        );
        let everything = field_with(&[0, 1, 2, 3], 4);
        picker.add_replication(&everything);

        let got = picker.assign(addr(1), &everything, 4);
        let idx: Vec<u32> = got.iter().map(|i| i.index).collect();
        // 3 first on priority; 1 never picked
        assert_eq!(idx[0], 3);
        assert!(!idx.contains(&1));
        assert_eq!(got.len(), 3);
    }
}
