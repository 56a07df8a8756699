//! The choke controller: reciprocal unchoking with an optimistic slot, and
//! the interest controller that decides which peers we request from at all.

use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::counter::RollingHistory;

/// Window of the block/cancel histories the interest controller reads.
pub const CANCEL_HISTORY_SECS: u64 = 60;

/// Never stay interested in fewer peers than this.
const MIN_INTERESTING_PEERS: usize = 5;

/// An optimistically unchoked peer keeps its slot for this many rechoke
/// ticks.
const OPTIMISTIC_UNCHOKE_TICKS: u8 = 4;

/// A connection younger than this counts as new and gets triple weight in
/// the optimistic draw.
const NEW_PEER_SECS: u64 = 45;

/// Everything the upload rechoke needs to know about one peer.
#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub addr: SocketAddr,
    /// The peer wants data from us.
    pub peer_interested: bool,
    /// We currently don't choke it.
    pub was_unchoked: bool,
    /// Transfer rate under the role-dependent key: our upload to them when
    /// seeding, both directions on a private torrent, their upload to us
    /// otherwise.
    pub rate: u64,
    /// Seeds and partial seeds don't need us and always stay choked.
    pub is_seed: bool,
    pub connected_at: Instant,
}

/// Everything the interest pass needs to know about one peer.
#[derive(Debug, Clone, Copy)]
pub struct InterestCandidate {
    pub addr: SocketAddr,
    /// The peer advertises pieces we still want.
    pub interesting: bool,
    /// Blocks it delivered within the cancel window.
    pub blocks: u32,
    /// Cancels we sent it within the cancel window.
    pub cancels: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RechokeState {
    Good,
    Untested,
    Bad,
}

fn classify(blocks: u32, cancels: u32) -> RechokeState {
    if blocks == 0 && cancels == 0 {
        RechokeState::Untested
    } else if cancels == 0 {
        RechokeState::Good
    } else if blocks == 0 {
        RechokeState::Bad
    } else if cancels * 10 < blocks {
        RechokeState::Good
    } else {
        RechokeState::Bad
    }
}

/// Per-torrent choking state, ticked every rechoke period.
#[derive(Debug)]
pub struct Choker {
    optimistic: Option<SocketAddr>,
    optimistic_ticks: u8,

    /// Adaptive cap on how many peers we stay interested in.
    max_interested: usize,

    /// How many peers the last pass declared interest in.
    interested_count: usize,

    /// When congestion (a high cancel rate) last shrank the cap.
    last_cancel_at: Option<Instant>,
}

impl Default for Choker {
    fn default() -> Self {
        Self::new()
    }
}

impl Choker {
    pub fn new() -> Self {
        Self {
            optimistic: None,
            optimistic_ticks: 0,
            max_interested: 0,
            interested_count: 0,
            last_cancel_at: None,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    pub fn forget_peer(&mut self, addr: &SocketAddr) {
        if self.optimistic == Some(*addr) {
            self.optimistic = None;
            self.optimistic_ticks = 0;
        }
    }

    /// Decide who we serve. Returns `(addr, unchoke)` pairs; setting the
    /// same state twice is deduplicated by the wire session, so decisions
    /// are emitted for every candidate.
    ///
    /// `choke_all` is set when the torrent isn't uploading at all;
    /// `saturated` when upload bandwidth is already maxed out, which stops
    /// new unchokes without revoking current ones.
    pub fn rechoke_uploads(
        &mut self,
        candidates: &[ChokeCandidate],
        choke_all: bool,
        saturated: bool,
        upload_slots: usize,
    ) -> Vec<(SocketAddr, bool)> {
        let now = Instant::now();
        let mut rng = rand::rng();
        let mut decisions = Vec::with_capacity(candidates.len());

        // the optimistic slot survives a fixed number of ticks
        if self.optimistic_ticks > 0 {
            self.optimistic_ticks -= 1;
        } else {
            self.optimistic = None;
        }

        struct Entry {
            addr: SocketAddr,
            interested: bool,
            was_unchoked: bool,
            rate: u64,
            is_new: bool,
            salt: u32,
            choked: bool,
        }

        let mut sorted: Vec<Entry> = Vec::with_capacity(candidates.len());

        for c in candidates {
            if c.is_seed || choke_all {
                decisions.push((c.addr, false));
            } else if self.optimistic == Some(c.addr) {
                // immune while the optimistic slot lasts
                decisions.push((c.addr, true));
            } else {
                sorted.push(Entry {
                    addr: c.addr,
                    interested: c.peer_interested,
                    was_unchoked: c.was_unchoked,
                    rate: c.rate,
                    is_new: now.duration_since(c.connected_at).as_secs()
                        < NEW_PEER_SECS,
                    salt: rng.random(),
                    choked: true,
                });
            }
        }

        // faster first, then the previously unchoked, then luck
        sorted.sort_unstable_by(|a, b| {
            b.rate
                .cmp(&a.rate)
                .then(a.was_unchoked.cmp(&b.was_unchoked).reverse())
                .then(a.salt.cmp(&b.salt))
        });

        // unchoke down the list until enough interested peers hold slots;
        // when saturated nobody new gets a slot
        let mut unchoked_interested = 0;
        let mut cursor = 0;
        while cursor < sorted.len() && unchoked_interested < upload_slots {
            let entry = &mut sorted[cursor];
            entry.choked = if saturated { !entry.was_unchoked } else { false };
            if entry.interested && !entry.choked {
                unchoked_interested += 1;
            }
            cursor += 1;
        }

        // optimistic unchoke: one of the remaining interested peers at
        // random, newcomers counted three times
        if self.optimistic.is_none() && !saturated {
            let mut pool: Vec<usize> = Vec::new();
            for (i, entry) in sorted.iter().enumerate().skip(cursor) {
                if entry.interested {
                    let weight = if entry.is_new { 3 } else { 1 };
                    for _ in 0..weight {
                        pool.push(i);
                    }
                }
            }
            if !pool.is_empty() {
                let i = pool[rng.random_range(0..pool.len())];
                sorted[i].choked = false;
                self.optimistic = Some(sorted[i].addr);
                self.optimistic_ticks = OPTIMISTIC_UNCHOKE_TICKS;
                debug!("optimistically unchoking {}", sorted[i].addr);
            }
        }

        for entry in sorted {
            decisions.push((entry.addr, !entry.choked));
        }

        decisions
    }

    /// Decide who we are interested in. Peers with a good block/cancel
    /// ratio come first, untested ones next; the count is capped
    /// adaptively: congestion (lots of recent cancels) shrinks it, calm
    /// periods grow it back.
    pub fn rechoke_interest(
        &mut self,
        candidates: &[InterestCandidate],
        max_connected: usize,
    ) -> Vec<(SocketAddr, bool)> {
        let now = Instant::now();
        let mut rng = rand::rng();
        let mut max_peers = self.max_interested;

        // congestion estimate over the responsive peers only: an
        // unresponsive peer's cancels say nothing about our bandwidth
        let mut blocks = 0u64;
        let mut cancels = 0u64;
        for c in candidates {
            if c.blocks == 0 {
                continue;
            }
            blocks += c.blocks as u64;
            cancels += c.cancels as u64;
        }

        if cancels > 0 {
            // of the requests we recently made, the share we cancelled;
            // higher means more congestion
            let cancel_rate = cancels as f64 / (cancels + blocks) as f64;
            let mult = 1.0 - cancel_rate.min(0.5);
            max_peers = (self.interested_count as f64 * mult) as usize;
            self.last_cancel_at = Some(now);
            trace!("cancel rate {cancel_rate:.3}, shrinking interest");
        }

        // no congestion on record counts as a long calm period
        let since_cancel = self
            .last_cancel_at
            .map(|at| now.duration_since(at).as_secs())
            .unwrap_or(2 * CANCEL_HISTORY_SECS);
        if since_cancel > 0 {
            const MAX_INCREASE: usize = 15;
            let max_history = 2 * CANCEL_HISTORY_SECS;
            let mult = since_cancel.min(max_history) as f64 / max_history as f64;
            max_peers =
                self.max_interested + (MAX_INCREASE as f64 * mult) as usize;
        }

        max_peers = max_peers.clamp(MIN_INTERESTING_PEERS, max_connected.max(MIN_INTERESTING_PEERS));
        self.max_interested = max_peers;

        // rank the interesting peers by their track record
        let mut ranked: Vec<(RechokeState, u32, SocketAddr)> = Vec::new();
        let mut decisions = Vec::with_capacity(candidates.len());

        for c in candidates {
            if !c.interesting {
                decisions.push((c.addr, false));
            } else {
                ranked.push((
                    classify(c.blocks, c.cancels),
                    rng.random(),
                    c.addr,
                ));
            }
        }

        ranked.sort_unstable();
        self.interested_count = max_peers.min(ranked.len());

        for (i, (_, _, addr)) in ranked.into_iter().enumerate() {
            decisions.push((addr, i < self.interested_count));
        }

        decisions
    }
}

/// The four per-peer recent-history rings read by the controllers.
#[derive(Debug, Default)]
pub struct PeerHistories {
    /// Blocks we uploaded to the peer.
    pub blocks_to_peer: RollingHistory,
    /// Blocks the peer delivered to us.
    pub blocks_to_client: RollingHistory,
    /// Cancels we sent to the peer.
    pub cancels_to_peer: RollingHistory,
    /// Cancels the peer sent to us.
    pub cancels_to_client: RollingHistory,
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    fn candidate(n: u8, rate: u64) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(n),
            peer_interested: true,
            was_unchoked: false,
            rate,
            is_seed: false,
            connected_at: Instant::now(),
        }
    }

    fn unchoked(decisions: &[(SocketAddr, bool)]) -> Vec<SocketAddr> {
        decisions
            .iter()
            .filter(|(_, unchoke)| *unchoke)
            .map(|(addr, _)| *addr)
            .collect()
    }

    #[test]
    fn top_rates_hold_the_slots() {
        let mut choker = Choker::new();
        let candidates = vec![
            candidate(1, 100_000),
            candidate(2, 50_000),
            candidate(3, 20_000),
            candidate(4, 10_000),
        ];

        let decisions =
            choker.rechoke_uploads(&candidates, false, false, 2);
        let open = unchoked(&decisions);

        // the two fastest always hold slots
        assert!(open.contains(&addr(1)));
        assert!(open.contains(&addr(2)));

        // the optimistic slot goes to one of the slow ones
        match choker.optimistic() {
            Some(opt) => {
                assert!(opt == addr(3) || opt == addr(4));
                assert_eq!(open.len(), 3);
            }
            None => panic!("optimistic slot not filled"),
        }
    }

    #[test]
    fn optimistic_slot_expires_after_four_ticks() {
        let mut choker = Choker::new();
        let candidates = vec![
            candidate(1, 100_000),
            candidate(2, 50_000),
            candidate(3, 0),
            candidate(4, 0),
        ];

        choker.rechoke_uploads(&candidates, false, false, 2);
        let first = choker.optimistic().unwrap();

        // the pick is immune for the following ticks
        for _ in 0..OPTIMISTIC_UNCHOKE_TICKS {
            choker.rechoke_uploads(&candidates, false, false, 2);
            assert_eq!(choker.optimistic(), Some(first));
        }

        // and after the immunity a fresh draw happens
        choker.rechoke_uploads(&candidates, false, false, 2);
        assert!(choker.optimistic().is_some());
    }

    #[test]
    fn seeds_and_idle_torrents_choke_everyone() {
        let mut choker = Choker::new();
        let mut seed = candidate(1, 100_000);
        seed.is_seed = true;

        let decisions = choker.rechoke_uploads(&[seed], false, false, 4);
        assert_eq!(decisions, vec![(addr(1), false)]);

        let decisions =
            choker.rechoke_uploads(&[candidate(2, 9000)], true, false, 4);
        assert!(unchoked(&decisions).is_empty());
    }

    #[test]
    fn saturation_stops_new_unchokes() {
        let mut choker = Choker::new();
        let mut old = candidate(1, 100_000);
        old.was_unchoked = true;
        let candidates = vec![old, candidate(2, 90_000)];

        let decisions =
            choker.rechoke_uploads(&candidates, false, true, 2);
        let open = unchoked(&decisions);
        assert_eq!(open, vec![addr(1)]);
        assert!(choker.optimistic().is_none());
    }

    #[test]
    fn interest_classification() {
        assert_eq!(classify(0, 0), RechokeState::Untested);
        assert_eq!(classify(50, 0), RechokeState::Good);
        assert_eq!(classify(0, 3), RechokeState::Bad);
        assert_eq!(classify(51, 5), RechokeState::Good);
        assert_eq!(classify(50, 5), RechokeState::Bad);
    }

    #[test]
    fn good_peers_win_interest() {
        let mut choker = Choker::new();

        let mut candidates = vec![InterestCandidate {
            addr: addr(0),
            interesting: false,
            blocks: 0,
            cancels: 0,
        }];
        // 20 interesting peers: even ones deliver, odd ones never did
        // anything but eat cancels
        for n in 1..=20u8 {
            candidates.push(InterestCandidate {
                addr: addr(n),
                interesting: true,
                blocks: if n % 2 == 0 { 100 } else { 0 },
                cancels: if n % 2 == 0 { 0 } else { 3 },
            });
        }

        let decisions = choker.rechoke_interest(&candidates, 50);

        let interested: Vec<SocketAddr> = decisions
            .iter()
            .filter(|(_, i)| *i)
            .map(|(a, _)| *a)
            .collect();

        // a peer with no wanted pieces never gets interest
        assert!(!interested.contains(&addr(0)));
        // the first pass grows the cap to 15, and every good peer (there
        // are 10) ranks ahead of every bad one
        assert_eq!(interested.len(), 15);
        for n in (2..=20u8).step_by(2) {
            assert!(interested.contains(&addr(n)));
        }
    }

    #[test]
    fn cancel_storm_shrinks_interest() {
        let mut choker = Choker::new();
        choker.max_interested = 20;
        choker.interested_count = 20;

        let candidates: Vec<InterestCandidate> = (1..=30u8)
            .map(|n| InterestCandidate {
                addr: addr(n),
                interesting: true,
                blocks: 10,
                cancels: 10,
            })
            .collect();

        let decisions = choker.rechoke_interest(&candidates, 50);
        let count = decisions.iter().filter(|(_, i)| *i).count();

        // cancel rate 0.5 halves the previous interested count
        assert_eq!(count, 10);
    }
}
