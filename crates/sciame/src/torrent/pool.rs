//! The pool of known peer endpoints for one torrent.
//!
//! An [`Atom`] outlives any single connection to its address: it remembers
//! where we learned about the endpoint, how connect attempts went, when it
//! last delivered piece data, and whether it earned a ban. The pool decides
//! which endpoints are worth dialing next and periodically prunes itself.

use std::{net::SocketAddr, time::Duration};

use hashbrown::{HashMap, HashSet};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    extensions::PexFlags, manager::Blocklist, peer::PeerId,
    torrent::TorrentPriority,
};

/// Where an endpoint was first heard of. Lower ordinal = more trusted, and
/// an atom always remembers the best source it was confirmed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AtomSource {
    Incoming = 0,
    Ltep = 1,
    Tracker = 2,
    Dht = 3,
    Pex = 4,
    Resume = 5,
    Lpd = 6,
}

impl AtomSource {
    /// How long an idle atom from this source stays on the shelf. Firsthand
    /// contact keeps longer than gossip.
    fn shelf_life(self) -> Duration {
        let secs = match self {
            AtomSource::Incoming | AtomSource::Ltep => 60 * 60 * 6,
            AtomSource::Tracker | AtomSource::Dht => 60 * 60 * 3,
            AtomSource::Pex => 60 * 60 * 2,
            AtomSource::Resume => 60 * 60,
            AtomSource::Lpd => 10 * 60,
        };
        Duration::from_secs(secs)
    }
}

/// Capability flags of an endpoint, folded in from handshakes and PEX.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    /// None until we learn whether the endpoint accepts connections.
    pub connectable: Option<bool>,
}

impl From<PexFlags> for AtomFlags {
    fn from(f: PexFlags) -> Self {
        Self {
            encryption: f.encryption,
            seed: f.seed,
            utp: f.utp,
            holepunch: f.holepunch,
            connectable: f.connectable.then_some(true),
        }
    }
}

/// A known peer endpoint, kept alive across disconnects.
#[derive(Debug)]
pub struct Atom {
    pub addr: SocketAddr,
    pub from_first: AtomSource,
    pub from_best: AtomSource,
    pub flags: AtomFlags,
    pub banned: bool,
    pub unreachable: bool,

    /// 0..=100, None when unknown. 100 if and only if the seed flag is set.
    pub seed_probability: Option<u8>,

    /// Consecutive failed connect attempts.
    pub num_fails: u32,

    pub piece_data_at: Option<Instant>,
    pub last_connection_at: Option<Instant>,
    pub last_connection_attempt_at: Option<Instant>,

    /// Last status change, the base of the reconnect schedule.
    pub changed_at: Instant,

    /// Soft expiry for pool-size pruning.
    pub shelf_date: Instant,

    /// Cached blocklist verdict, valid for `blocklist_gen`.
    blocklisted: Option<bool>,
    blocklist_gen: u64,

    /// Id of the live connection bound to this atom, if any. The peer
    /// itself lives in the torrent's peer table under the same address.
    pub peer: Option<PeerId>,
}

impl Atom {
    fn new(addr: SocketAddr, source: AtomSource, now: Instant) -> Self {
        let jitter =
            Duration::from_secs(rand::rng().random_range(0..(60 * 10)));
        Self {
            addr,
            from_first: source,
            from_best: source,
            flags: AtomFlags::default(),
            banned: false,
            unreachable: false,
            seed_probability: None,
            num_fails: 0,
            piece_data_at: None,
            last_connection_at: None,
            last_connection_attempt_at: None,
            changed_at: now,
            shelf_date: now + source.shelf_life() + jitter,
            blocklisted: None,
            blocklist_gen: 0,
            peer: None,
        }
    }

    pub fn set_seed_probability(&mut self, probability: u8) {
        let probability = probability.min(100);
        self.seed_probability = Some(probability);
        self.flags.seed = probability == 100;
    }

    pub fn is_seed(&self) -> bool {
        self.flags.seed
    }

    /// Whether the last attempt to reach this endpoint failed.
    fn failed_last_attempt(&self) -> bool {
        match (self.last_connection_at, self.last_connection_attempt_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(connected), Some(attempted)) => connected < attempted,
        }
    }

    fn blocklisted(&mut self, blocklist: &dyn Blocklist) -> bool {
        let gen = blocklist.generation();
        if self.blocklisted.is_none() || self.blocklist_gen != gen {
            self.blocklisted = Some(blocklist.contains(&self.addr.ip()));
            self.blocklist_gen = gen;
        }
        self.blocklisted.unwrap_or(false)
    }
}

/// What the owning torrent feeds into candidate scoring.
#[derive(Debug, Clone, Copy)]
pub struct CandidateCriteria {
    pub seeding: bool,
    pub recently_started: bool,
    pub priority: TorrentPriority,
}

#[derive(Debug)]
pub struct Pool {
    atoms: HashMap<SocketAddr, Atom>,
    epoch: Instant,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self { atoms: HashMap::new(), epoch: Instant::now() }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Atom> {
        self.atoms.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Atom> {
        self.atoms.get_mut(addr)
    }

    /// Record an endpoint, merging what the new sighting tells us. The best
    /// source and any newly learned flags stick to the atom.
    pub fn ensure(
        &mut self,
        addr: SocketAddr,
        source: AtomSource,
        flags: Option<PexFlags>,
    ) -> &mut Atom {
        let now = Instant::now();
        let atom = self
            .atoms
            .entry(addr)
            .or_insert_with(|| Atom::new(addr, source, now));

        atom.from_best = atom.from_best.min(source);

        if let Some(flags) = flags {
            atom.flags.encryption |= flags.encryption;
            atom.flags.utp |= flags.utp;
            atom.flags.holepunch |= flags.holepunch;
            if flags.connectable {
                atom.flags.connectable = Some(true);
            }
            if flags.seed {
                atom.set_seed_probability(100);
            }
        }

        atom
    }

    /// An outbound dial is leaving for this address.
    pub fn mark_attempt(&mut self, addr: &SocketAddr) {
        if let Some(atom) = self.atoms.get_mut(addr) {
            let now = Instant::now();
            atom.last_connection_attempt_at = Some(now);
            atom.changed_at = now;
        }
    }

    /// A handshake completed and a wire session now runs on this address.
    pub fn mark_connected(&mut self, addr: &SocketAddr, peer_id: PeerId) {
        if let Some(atom) = self.atoms.get_mut(addr) {
            let now = Instant::now();
            atom.last_connection_at = Some(now);
            atom.changed_at = now;
            atom.num_fails = 0;
            atom.unreachable = false;
            atom.flags.connectable = Some(true);
            atom.peer = Some(peer_id);
        }
    }

    /// The connection at this address ended. A graceful close resets
    /// nothing; an errored one counts a failure, and one that never even
    /// produced a byte marks the endpoint unreachable.
    pub fn mark_closed(
        &mut self,
        addr: &SocketAddr,
        graceful: bool,
        read_anything: bool,
    ) {
        if let Some(atom) = self.atoms.get_mut(addr) {
            atom.peer = None;
            atom.changed_at = Instant::now();
            if !graceful {
                atom.num_fails += 1;
                if !read_anything {
                    atom.unreachable = true;
                }
            }
        }
    }

    pub fn on_piece_data(&mut self, addr: &SocketAddr) {
        if let Some(atom) = self.atoms.get_mut(addr) {
            atom.piece_data_at = Some(Instant::now());
        }
    }

    pub fn ban(&mut self, addr: &SocketAddr) {
        if let Some(atom) = self.atoms.get_mut(addr) {
            debug!("banning {addr}");
            atom.banned = true;
            atom.changed_at = Instant::now();
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.atoms.get(addr).map(|a| a.banned).unwrap_or(false)
    }

    /// How long after its last status change an atom may be dialed again.
    /// Grows with consecutive failures, doubles for endpoints that were
    /// unreachable outright, and shrinks to seconds for an endpoint that
    /// was delivering piece data just before the connection dropped.
    pub fn reconnect_interval(atom: &Atom, now: Instant) -> Duration {
        const MINIMUM_RECONNECT_SECS: u64 = 5;

        let mut secs = if atom
            .piece_data_at
            .map(|at| {
                now.duration_since(at).as_secs() <= MINIMUM_RECONNECT_SECS * 2
            })
            .unwrap_or(false)
        {
            MINIMUM_RECONNECT_SECS
        } else {
            match atom.num_fails {
                0 => 0,
                1 => 5,
                2 => 2 * 60,
                3 => 15 * 60,
                4 => 30 * 60,
                5 => 60 * 60,
                _ => 120 * 60,
            }
        };

        if atom.unreachable {
            secs += secs;
        }

        Duration::from_secs(secs)
    }

    /// Pick up to `max` endpoints worth dialing now. `in_flight` carries the
    /// addresses with a live peer, outgoing handshake, or incoming
    /// handshake; they are never candidates.
    ///
    /// Scores pack the criteria into one integer, smaller is better, and a
    /// partial selection keeps this linear in the pool size.
    pub fn candidates(
        &mut self,
        criteria: CandidateCriteria,
        in_flight: &HashSet<SocketAddr>,
        blocklist: &dyn Blocklist,
        max: usize,
    ) -> Vec<SocketAddr> {
        let now = Instant::now();
        let epoch = self.epoch;

        let mut scored: Vec<(u64, SocketAddr)> = Vec::new();

        for atom in self.atoms.values_mut() {
            if atom.peer.is_some() || in_flight.contains(&atom.addr) {
                continue;
            }
            if atom.banned {
                continue;
            }
            // no point in both sides seeding
            if criteria.seeding && atom.is_seed() {
                continue;
            }
            if now.duration_since(atom.changed_at)
                < Self::reconnect_interval(atom, now)
            {
                continue;
            }
            if atom.blocklisted(blocklist) {
                continue;
            }

            let salt: u8 = rand::rng().random();
            scored.push((
                Self::score(atom, criteria, epoch, salt),
                atom.addr,
            ));
        }

        if scored.len() > max && max > 0 {
            scored.select_nth_unstable_by_key(max - 1, |(score, _)| *score);
        }
        scored.truncate(max);

        trace!("{} candidates of {} atoms", scored.len(), self.atoms.len());
        scored.into_iter().map(|(_, addr)| addr).collect()
    }

    /// Pack the candidate-ranking fields into one 64-bit key, most
    /// significant first. Smaller value wins.
    fn score(
        atom: &Atom,
        criteria: CandidateCriteria,
        epoch: Instant,
        salt: u8,
    ) -> u64 {
        fn add(key: u64, width: u32, val: u64) -> u64 {
            (key << width) | (val & ((1 << width) - 1))
        }

        let mut key = 0u64;

        // prefer endpoints we reached, or never tried, over failed ones
        key = add(key, 1, atom.failed_last_attempt() as u64);

        // prefer the one attempted least recently, to cycle through all
        let attempt_secs = atom
            .last_connection_attempt_at
            .map(|at| at.duration_since(epoch).as_secs())
            .unwrap_or(0);
        key = add(key, 32, attempt_secs);

        // higher-priority torrents dial first
        key = add(key, 4, criteria.priority as u64);

        // prefer recently-started torrents
        key = add(key, 1, !criteria.recently_started as u64);

        // prefer torrents we're still downloading
        key = add(key, 1, criteria.seeding as u64);

        // prefer endpoints known to be connectable
        key = add(key, 1, atom.flags.connectable.is_none() as u64);

        // prefer endpoints we might upload to: lower seed probability is
        // better, unknown next, certain seeds last
        let seed_prob = match atom.seed_probability {
            Some(100) => 101,
            None => 100,
            Some(p) => p as u64,
        };
        key = add(key, 8, seed_prob);

        // more trusted discovery sources win ties
        key = add(key, 4, atom.from_best as u64);

        add(key, 8, salt as u64)
    }

    /// Shrink the pool towards its cap: everything in use stays, the rest
    /// is ranked by recent piece data and shelf date and the tail is freed.
    pub fn age(
        &mut self,
        max_connected_peers: u32,
        in_flight: &HashSet<SocketAddr>,
    ) {
        let n = max_connected_peers as usize;
        let max_atoms = if n >= 55 {
            n + 150
        } else if n >= 20 {
            2 * n + 95
        } else {
            4 * n + 55
        };

        if self.atoms.len() <= max_atoms {
            return;
        }

        let now = Instant::now();
        let hour = Duration::from_secs(60 * 60);
        let epoch = self.epoch;

        let mut spare: Vec<(u64, u64, SocketAddr)> = Vec::new();
        let mut in_use = 0usize;

        for atom in self.atoms.values() {
            if atom.peer.is_some() || in_flight.contains(&atom.addr) {
                in_use += 1;
                continue;
            }
            // recent piece data is the primary key, but only within the
            // last hour; after that only the shelf date matters
            let piece_key = atom
                .piece_data_at
                .filter(|at| now.duration_since(*at) < hour)
                .map(|at| at.duration_since(epoch).as_secs())
                .unwrap_or(0);
            let shelf_key = atom.shelf_date.duration_since(epoch).as_secs();
            spare.push((piece_key, shelf_key, atom.addr));
        }

        let keep_spare = max_atoms.saturating_sub(in_use);
        if spare.len() <= keep_spare {
            return;
        }

        // best first: most recent piece data, then latest shelf date
        spare.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        let before = self.atoms.len();
        for (_, _, addr) in spare.drain(keep_spare..) {
            self.atoms.remove(&addr);
        }

        debug!(
            "atom pool pruned from {before} to {} (cap {max_atoms})",
            self.atoms.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    struct NoBlocklist;
    impl Blocklist for NoBlocklist {
        fn contains(&self, _ip: &IpAddr) -> bool {
            false
        }
        fn generation(&self) -> u64 {
            0
        }
    }

    struct AllBlocked;
    impl Blocklist for AllBlocked {
        fn contains(&self, _ip: &IpAddr) -> bool {
            true
        }
        fn generation(&self) -> u64 {
            1
        }
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 6881)
    }

    fn criteria() -> CandidateCriteria {
        CandidateCriteria {
            seeding: false,
            recently_started: true,
            priority: TorrentPriority::Normal,
        }
    }

    #[test]
    fn source_ordering_sticks_to_the_best() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Pex, None);
        pool.ensure(addr(1), AtomSource::Tracker, None);
        pool.ensure(addr(1), AtomSource::Lpd, None);

        let atom = pool.get(&addr(1)).unwrap();
        assert_eq!(atom.from_first, AtomSource::Pex);
        assert_eq!(atom.from_best, AtomSource::Tracker);
        assert!(atom.from_best <= atom.from_first);
    }

    #[test]
    fn seed_probability_and_seed_flag_agree() {
        let mut pool = Pool::new();
        let atom = pool.ensure(addr(1), AtomSource::Tracker, None);

        atom.set_seed_probability(40);
        assert!(!atom.is_seed());

        atom.set_seed_probability(100);
        assert!(atom.is_seed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_schedule() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Tracker, None);
        let now = Instant::now();

        let atom = pool.get_mut(&addr(1)).unwrap();
        assert_eq!(
            Pool::reconnect_interval(atom, now),
            Duration::from_secs(0)
        );

        atom.num_fails = 2;
        assert_eq!(
            Pool::reconnect_interval(atom, now),
            Duration::from_secs(120)
        );

        // unreachable doubles the wait
        atom.unreachable = true;
        assert_eq!(
            Pool::reconnect_interval(atom, now),
            Duration::from_secs(240)
        );

        // unless it was feeding us piece data moments ago
        atom.piece_data_at = Some(now);
        assert_eq!(
            Pool::reconnect_interval(atom, now),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_gate_candidates() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Tracker, None);

        pool.mark_attempt(&addr(1));
        pool.mark_closed(&addr(1), false, false);

        // one failure: not eligible again for 5 (doubled to 10) seconds
        let none = pool.candidates(
            criteria(),
            &HashSet::new(),
            &NoBlocklist,
            10,
        );
        assert!(none.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let some = pool.candidates(
            criteria(),
            &HashSet::new(),
            &NoBlocklist,
            10,
        );
        assert_eq!(some, vec![addr(1)]);
    }

    #[test]
    fn banned_and_blocklisted_are_never_candidates() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Tracker, None);
        pool.ensure(addr(2), AtomSource::Tracker, None);
        pool.ban(&addr(1));

        let picked = pool.candidates(
            criteria(),
            &HashSet::new(),
            &NoBlocklist,
            10,
        );
        assert_eq!(picked, vec![addr(2)]);

        let picked =
            pool.candidates(criteria(), &HashSet::new(), &AllBlocked, 10);
        assert!(picked.is_empty());
    }

    #[test]
    fn live_peers_are_not_candidates() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Tracker, None);
        pool.mark_connected(&addr(1), PeerId::gen());

        let picked = pool.candidates(
            criteria(),
            &HashSet::new(),
            &NoBlocklist,
            10,
        );
        assert!(picked.is_empty());

        // an atom never has both a live peer and an in-flight handshake
        let atom = pool.get(&addr(1)).unwrap();
        assert!(atom.peer.is_some());
    }

    #[test]
    fn seeds_are_skipped_while_seeding() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Tracker, None)
            .set_seed_probability(100);
        pool.ensure(addr(2), AtomSource::Tracker, None);

        let mut c = criteria();
        c.seeding = true;
        let picked =
            pool.candidates(c, &HashSet::new(), &NoBlocklist, 10);
        assert_eq!(picked, vec![addr(2)]);
    }

    #[test]
    fn better_sources_score_ahead() {
        let mut pool = Pool::new();
        pool.ensure(addr(1), AtomSource::Lpd, None);
        pool.ensure(addr(2), AtomSource::Incoming, None);

        let picked = pool.candidates(
            criteria(),
            &HashSet::new(),
            &NoBlocklist,
            1,
        );
        assert_eq!(picked, vec![addr(2)]);
    }

    #[test]
    fn ageing_keeps_in_use_atoms() {
        let mut pool = Pool::new();
        // cap for max_connected_peers = 1 is 4*1 + 55 = 59
        for i in 0..70 {
            pool.ensure(addr(i), AtomSource::Tracker, None);
        }
        pool.mark_connected(&addr(0), PeerId::gen());
        // a recently generous endpoint survives pruning
        pool.on_piece_data(&addr(69));

        pool.age(1, &HashSet::new());

        assert_eq!(pool.len(), 59);
        assert!(pool.get(&addr(0)).is_some());
        assert!(pool.get(&addr(69)).is_some());
    }
}
