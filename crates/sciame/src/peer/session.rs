use std::time::Duration;

use tokio::time::Instant;

use crate::{
    config::CONFIG,
    extensions::{PexView, BLOCK_LEN},
};

/// At any given time, a connection with a handshaked peer has 3 possible
/// states. Even if the peer is choked they are still marked here as
/// connected.
#[derive(Clone, Default, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    /// The handshake just happened, availability messages and the extended
    /// handshake are going out.
    #[default]
    Connecting,

    /// Connected, downloading and uploading.
    Connected,

    /// Set while the peer task unwinds, so teardown paths can tell a
    /// deliberate shutdown from a connection error.
    Quitting,
}

/// Batch period of messages that must leave on the next flush.
pub const IMMEDIATE_PRIORITY: Duration = Duration::ZERO;

/// Batch period of metadata and PEX traffic.
pub const HIGH_PRIORITY: Duration = Duration::from_secs(2);

/// Batch period of `Have` announcements.
pub const LOW_PRIORITY: Duration = Duration::from_secs(10);

/// Idle seconds before we send a keepalive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(100);

/// Seconds between PEX messages to the same peer.
pub const PEX_INTERVAL: Duration = Duration::from_secs(90);

/// How many seconds of transfer the outstanding-request queue should cover.
const REQUEST_BUF_SECS: u64 = 10;

/// Refill when the queue drops to this fraction of its target.
const REFILL_THRESHOLD_NUM: usize = 2;
const REFILL_THRESHOLD_DEN: usize = 3;

/// Holds connection-local state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    /// How many block requests we keep outstanding towards this peer,
    /// recomputed whenever a choke or unchoke arrives.
    pub target_request_queue_len: u16,

    /// `reqq` the peer advertised on its extended handshake.
    pub peer_reqq: Option<u16>,

    /// When the oldest unflushed message was queued, None when the outbound
    /// buffer is flushed.
    pub batched_at: Option<Instant>,

    /// The lowest priority pushed since the last flush.
    pub batch_period: Duration,

    /// The last time anything was written to the socket, drives keepalives.
    pub last_write_at: Instant,

    /// The swarm view most recently sent to this peer over PEX.
    pub pex_view: PexView,

    /// The torrent is complete, only seed to this peer.
    pub seed_only: bool,

    /// The time the wire session started, i.e. right after handshaking.
    pub connected_at: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection: Default::default(),
            target_request_queue_len: Session::DEFAULT_REQUEST_QUEUE_LEN,
            peer_reqq: None,
            batched_at: None,
            batch_period: LOW_PRIORITY,
            last_write_at: Instant::now(),
            pex_view: PexView::new(),
            seed_only: false,
            connected_at: Instant::now(),
        }
    }
}

impl Session {
    /// Outstanding-request target before we've seen any transfer rate.
    /// Most clients accept 250+ inflight requests, this stays conservative
    /// until the rate-based computation takes over.
    pub const DEFAULT_REQUEST_QUEUE_LEN: u16 = 4;

    /// Recompute how many requests we want outstanding: enough to cover
    /// [`REQUEST_BUF_SECS`] of transfer at the effective download rate,
    /// clamped by the peer-advertised `reqq`.
    ///
    /// The caller zeroes the queue by not requesting when choked,
    /// uninterested, metadata-less, or seeding.
    pub fn update_target_request_queue(
        &mut self,
        peer_rate_bps: u64,
        torrent_limit_bps: u64,
    ) {
        let mut rate = peer_rate_bps;
        if torrent_limit_bps > 0 {
            rate = rate.min(torrent_limit_bps);
        }
        if CONFIG.download_rate_limit > 0 {
            rate = rate.min(CONFIG.download_rate_limit);
        }

        let estimated = (rate * REQUEST_BUF_SECS) / BLOCK_LEN as u64;
        let mut target = estimated.max(4) as u16;

        if let Some(reqq) = self.peer_reqq {
            target = target.min(reqq.max(1));
        }

        self.target_request_queue_len = target;
    }

    /// True when the pipeline has drained enough to ask for more blocks.
    pub fn should_refill(&self, pending: usize) -> bool {
        let target = self.target_request_queue_len as usize;
        pending * REFILL_THRESHOLD_DEN <= target * REFILL_THRESHOLD_NUM
    }

    /// Queue a message priority: the effective batch period is the minimum
    /// pushed since the last flush. Returns true when a flush is due right
    /// now.
    pub fn push_priority(&mut self, priority: Duration, now: Instant) -> bool {
        match self.batched_at {
            None => {
                self.batched_at = Some(now);
                self.batch_period = priority;
            }
            Some(_) => {
                self.batch_period = self.batch_period.min(priority);
            }
        }
        priority.is_zero()
    }

    /// True when the batch deadline has passed.
    pub fn flush_due(&self, now: Instant) -> bool {
        match self.batched_at {
            Some(at) => now.duration_since(at) >= self.batch_period,
            None => false,
        }
    }

    pub fn mark_flushed(&mut self, now: Instant) {
        self.batched_at = None;
        self.batch_period = LOW_PRIORITY;
        self.last_write_at = now;
    }

    /// True when the link has been quiet long enough to owe a keepalive.
    pub fn keepalive_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_write_at) >= KEEPALIVE_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_queue_follows_rate() {
        let mut session = Session::default();

        // idle link floors at 4
        session.update_target_request_queue(0, 0);
        assert_eq!(session.target_request_queue_len, 4);

        // 1 MiB/s over 10 s is 640 blocks
        session.update_target_request_queue(1024 * 1024, 0);
        assert_eq!(session.target_request_queue_len, 640);

        // the torrent cap wins over the observed rate
        session.update_target_request_queue(1024 * 1024, 160 * 1024);
        assert_eq!(session.target_request_queue_len, 100);

        // and reqq clamps everything
        session.peer_reqq = Some(64);
        session.update_target_request_queue(1024 * 1024, 0);
        assert_eq!(session.target_request_queue_len, 64);
    }

    #[test]
    fn refill_at_two_thirds() {
        let mut session = Session::default();
        session.target_request_queue_len = 30;
        assert!(session.should_refill(20));
        assert!(!session.should_refill(21));
        assert!(session.should_refill(0));
    }

    #[test]
    fn batch_period_is_the_minimum() {
        let mut session = Session::default();
        let now = Instant::now();

        assert!(!session.push_priority(LOW_PRIORITY, now));
        assert_eq!(session.batch_period, LOW_PRIORITY);

        assert!(!session.push_priority(HIGH_PRIORITY, now));
        assert_eq!(session.batch_period, HIGH_PRIORITY);

        // immediate priority flushes right away
        assert!(session.push_priority(IMMEDIATE_PRIORITY, now));

        session.mark_flushed(now);
        assert!(session.batched_at.is_none());
    }
}
