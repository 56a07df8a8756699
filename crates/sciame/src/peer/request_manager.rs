//! Bookkeeping of the blocks we asked a single peer for.

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::extensions::BlockInfo;

/// The blocks requested from one peer that haven't been answered yet.
///
/// The torrent's ledger is the authority on which block belongs to which
/// peer; this mirror is what lets the wire session validate incoming
/// `Piece` messages without a round trip.
#[derive(Default)]
pub struct RequestManager {
    requests: HashMap<BlockInfo, Instant>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, block: BlockInfo) {
        self.requests.insert(block, Instant::now());
    }

    /// Remove a request, true if it was pending. A block that arrives with
    /// a length different from the one requested does not match and is not
    /// credited.
    pub fn remove(&mut self, block: &BlockInfo) -> bool {
        self.requests.remove(block).is_some()
    }

    pub fn contains(&self, block: &BlockInfo) -> bool {
        self.requests.contains_key(block)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Take everything, e.g. when the peer chokes us without the fast
    /// extension and all pending requests are implicitly dropped.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        self.requests.drain().map(|(block, _)| block).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove() {
        let mut manager = RequestManager::new();
        let block = BlockInfo::new(0, 0, 16384);

        manager.add(block);
        assert_eq!(manager.len(), 1);
        assert!(manager.contains(&block));

        assert!(manager.remove(&block));
        assert!(manager.is_empty());

        // removing twice is a no-op
        assert!(!manager.remove(&block));
    }

    #[test]
    fn mismatched_len_is_a_different_request() {
        let mut manager = RequestManager::new();
        manager.add(BlockInfo::new(0, 0, 16384));

        // a block with the wrong length does not match the request
        assert!(!manager.remove(&BlockInfo::new(0, 0, 1000)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn drain_takes_everything() {
        let mut manager = RequestManager::new();
        manager.add(BlockInfo::new(0, 0, 16384));
        manager.add(BlockInfo::new(0, 16384, 16384));

        let drained = manager.drain();
        assert_eq!(drained.len(), 2);
        assert!(manager.is_empty());
    }
}
