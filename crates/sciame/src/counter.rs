//! Transfer accounting: smoothed rates and short recent-event histories.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor.
/// Higher values = more responsive to changes, lower values = smoother.
const EMA_ALPHA: f64 = 0.3;

/// Counter of rates, used in downloaded and uploaded.
#[derive(Debug)]
pub struct Counter {
    // -- cumulative counters --
    pub total_downloaded: AtomicU64,
    pub total_uploaded: AtomicU64,

    // -- smoothed rates in bytes per second --
    download_rate: AtomicU64,
    upload_rate: AtomicU64,

    // -- internal state --
    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    inner: Mutex<Ema>,
}

#[derive(Debug)]
struct Ema {
    last_update: Instant,
    download: f64,
    upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            inner: Mutex::new(Ema {
                last_update: Instant::now(),
                download: 0.0,
                upload: 0.0,
            }),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record downloaded piece-data bytes.
    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record uploaded piece-data bytes.
    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    /// Fold the window counters into the EMA rates. Called on the torrent's
    /// heartbeat; between calls the stored rates stay frozen.
    pub fn update_rates(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let elapsed = now.duration_since(inner.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        let dl_rate = downloaded as f64 / elapsed;
        let ul_rate = uploaded as f64 / elapsed;

        inner.download = if inner.download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * inner.download
        };
        inner.upload = if inner.upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * inner.upload
        };

        self.download_rate.store(inner.download as u64, Ordering::Relaxed);
        self.upload_rate.store(inner.upload as u64, Ordering::Relaxed);

        inner.last_update = now;
    }
}

/// How many one-second buckets a [`RollingHistory`] keeps. Queries never look
/// further back than this.
const HISTORY_BUCKETS: u64 = 64;

/// Counts events over a short sliding window with one-second granularity.
///
/// Used for the blocks-sent / cancels-sent rings that drive the interest
/// controller: "how many blocks did this peer send us in the last 60
/// seconds" and friends.
#[derive(Debug)]
pub struct RollingHistory {
    epoch: Instant,
    stamps: [u64; HISTORY_BUCKETS as usize],
    counts: [u32; HISTORY_BUCKETS as usize],
}

impl Default for RollingHistory {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            stamps: [u64::MAX; HISTORY_BUCKETS as usize],
            counts: [0; HISTORY_BUCKETS as usize],
        }
    }
}

impl RollingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn second(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Add `n` events at the current time.
    pub fn add(&mut self, n: u32) {
        let now = self.second();
        let i = (now % HISTORY_BUCKETS) as usize;
        if self.stamps[i] != now {
            self.stamps[i] = now;
            self.counts[i] = 0;
        }
        self.counts[i] += n;
    }

    /// How many events happened in the last `window_secs` seconds.
    pub fn count(&self, window_secs: u64) -> u32 {
        let now = self.second();
        let cutoff = now.saturating_sub(window_secs.min(HISTORY_BUCKETS - 1));
        self.stamps
            .iter()
            .zip(&self.counts)
            .filter(|(&stamp, _)| stamp != u64::MAX && stamp >= cutoff && stamp <= now)
            .map(|(_, &c)| c)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn history_window() {
        let mut h = RollingHistory::new();
        h.add(3);

        tokio::time::advance(Duration::from_secs(10)).await;
        h.add(2);

        assert_eq!(h.count(60), 5);
        assert_eq!(h.count(5), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(h.count(60), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rates_follow_traffic() {
        let counter = Counter::new();
        counter.record_download(10_000);
        counter.record_upload(5_000);

        tokio::time::advance(Duration::from_secs(1)).await;
        counter.update_rates();

        assert!(counter.download_rate() > 0);
        assert!(counter.upload_rate() > 0);
        assert!(counter.download_rate() > counter.upload_rate());
        assert_eq!(counter.total_downloaded.load(Ordering::Relaxed), 10_000);
    }
}
