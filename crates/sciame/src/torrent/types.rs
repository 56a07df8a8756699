use std::{fmt::Display, net::SocketAddr, sync::Arc};

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    bitfield::PieceField,
    extensions::{Block, BlockInfo, Extension, PexFlags, PexView, BLOCK_LEN},
    peer::PeerCtx,
    torrent::pool::AtomSource,
};

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

/// Piece geometry of a torrent, known once the metadata is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    pub piece_count: usize,
    pub piece_len: u32,
    pub total_len: u64,
}

impl Layout {
    /// Size of a piece; the last one is usually short.
    pub fn piece_size(&self, index: usize) -> u32 {
        if index + 1 == self.piece_count {
            let full = self.piece_len as u64 * (self.piece_count as u64 - 1);
            (self.total_len - full) as u32
        } else {
            self.piece_len
        }
    }

    /// Nominal number of blocks per full piece, the stride of the global
    /// block index.
    pub fn blocks_per_piece(&self) -> u32 {
        self.piece_len.div_ceil(BLOCK_LEN)
    }

    /// Number of blocks in one specific piece.
    pub fn blocks_in_piece(&self, index: usize) -> u32 {
        self.piece_size(index).div_ceil(BLOCK_LEN)
    }

    /// Length of the nth block of a piece, short for the final block of the
    /// final piece.
    pub fn block_len(&self, index: usize, nth: u32) -> u32 {
        let piece_size = self.piece_size(index);
        let offset = nth * BLOCK_LEN;
        (piece_size - offset).min(BLOCK_LEN)
    }

    pub fn block_info(&self, index: usize, nth: u32) -> BlockInfo {
        BlockInfo {
            index: index as u32,
            begin: nth * BLOCK_LEN,
            len: self.block_len(index, nth),
        }
    }

    /// Global block index used by the request ledger's ordering.
    pub fn block_index(&self, info: &BlockInfo) -> u64 {
        info.index as u64 * self.blocks_per_piece() as u64
            + (info.begin / BLOCK_LEN) as u64
    }

    /// Whether a request names a real block of this torrent with the exact
    /// boundaries we'd compute for it.
    pub fn contains_block(&self, info: &BlockInfo) -> bool {
        let index = info.index as usize;
        if index >= self.piece_count {
            return false;
        }
        let piece_size = self.piece_size(index) as u64;
        let begin = info.begin as u64;
        let len = info.len as u64;
        len > 0
            && len <= BLOCK_LEN as u64
            && begin < piece_size
            && begin + len <= piece_size
    }
}

/// What the embedding application knows about a torrent when it hands it to
/// the engine.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: InfoHash,
    pub name: String,

    /// Piece geometry, None when starting from a magnet link.
    pub layout: Option<Layout>,

    /// The raw info dict, served to peers over ut_metadata when present.
    pub metadata: Option<Vec<u8>>,

    /// Private torrents never use PEX and don't advertise metadata.
    pub private: bool,

    /// Per-piece priority, 0 meaning "don't download". None means
    /// everything at normal priority.
    pub piece_priorities: Option<Vec<u8>>,

    /// Pieces already verified on disk, None when starting fresh.
    pub have_pieces: Option<PieceField>,

    /// Per-torrent download cap in bytes per second, 0 means unlimited.
    pub download_limit: u64,

    /// Overrides the configured per-torrent connection cap.
    pub max_connected_peers: Option<u32>,

    /// Weighed when picking connection candidates across torrents.
    pub priority: TorrentPriority,

    /// False pauses all uploading: every peer stays choked.
    pub upload_allowed: bool,

    /// Webseed URLs known for this torrent. The engine doesn't drive them,
    /// but they count as active download sources in endgame math.
    pub webseeds: Vec<String>,
}

/// Context of a torrent that is shared with its peers.
#[derive(Debug)]
pub struct TorrentCtx {
    pub tx: mpsc::Sender<TorrentMsg>,
    pub btx: broadcast::Sender<PeerBrMsg>,
    pub cache_tx: mpsc::Sender<CacheMsg>,
    pub stats_tx: mpsc::UnboundedSender<StatsMsg>,
    pub info_hash: InfoHash,
    pub private: bool,
    pub download_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TorrentStatus {
    Downloading,
    Seeding,
}

/// Relative priority of a torrent, weighed when picking which endpoints to
/// connect to next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TorrentPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

/// The initial snapshot a peer receives right after registering.
#[derive(Debug)]
pub struct PeerSyncInfo {
    pub layout: Option<Layout>,
    pub metadata_size: Option<u32>,
    pub local_pieces: PieceField,
    pub upload_only: bool,
}

/// Broadcasts from a torrent to all of its peers.
#[derive(Debug, Clone)]
pub enum PeerBrMsg {
    /// We completed and verified a piece.
    HavePiece(usize),

    /// The current swarm view, for the per-peer PEX diff.
    PexView(Arc<PexView>),

    /// The download completed, stop requesting.
    Seedonly,

    /// The torrent is shutting down.
    Quit,
}

/// Every event a torrent reacts to: wire messages surfaced by its peers,
/// completions from the cache, and additions from the manager. One message
/// enum, one dispatch site.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A wire session finished its handshake and wants the initial sync.
    PeerConnected {
        ctx: Arc<PeerCtx>,
        recipient: oneshot::Sender<PeerSyncInfo>,
    },

    /// A wire session ended; `graceful` is false when it died on an error,
    /// `read_anything` false when the remote never sent a byte.
    PeerClosed { addr: SocketAddr, graceful: bool, read_anything: bool },

    /// An outbound connect attempt failed before the handshake completed.
    ConnectFailed { addr: SocketAddr, read_anything: bool },

    GotBitfield { addr: SocketAddr, pieces: PieceField },
    GotHave { addr: SocketAddr, piece: usize },
    GotHaveAll { addr: SocketAddr },
    GotHaveNone { addr: SocketAddr },

    /// A requested block arrived and went to the cache.
    GotBlock { addr: SocketAddr, info: BlockInfo },

    /// The peer rejected one of our requests (fast extension).
    GotReject { addr: SocketAddr, info: BlockInfo },

    /// The peer cancelled one of its requests to us.
    GotCancel { addr: SocketAddr },

    /// Requests a peer returned wholesale, e.g. on a fast-less choke.
    ReturnBlocks { addr: SocketAddr, blocks: Vec<BlockInfo> },

    GotSuggest { addr: SocketAddr, piece: usize },
    GotAllowedFast { addr: SocketAddr, piece: usize },

    /// The peer told us its DHT port.
    GotPort { addr: SocketAddr, port: u16 },

    /// The peer sent its extended handshake.
    GotExtendedHandshake { addr: SocketAddr, ext: Extension },

    /// A peer's request pipeline drained below its refill threshold.
    NeedBlocks { addr: SocketAddr, numwant: usize },

    /// We served a block to this peer.
    SentPieceData { addr: SocketAddr, len: u32 },

    /// A metadata piece arrived over ut_metadata.
    GotMetadataPiece {
        piece: u32,
        total_size: Option<u32>,
        payload: Vec<u8>,
    },

    /// A peer asked for a metadata piece we may hold.
    RequestMetadataPiece {
        piece: u32,
        recipient: oneshot::Sender<Option<(u32, Vec<u8>)>>,
    },

    /// New endpoints learned from PEX, trackers, DHT, or a resume file.
    AddPeers { peers: Vec<(SocketAddr, PexFlags)>, source: AtomSource },

    /// The cache finished checking a completed piece.
    PieceChecked { piece: usize, ok: bool },

    /// The embedding application delivered the metadata for a torrent that
    /// started from a magnet link.
    GotMetadata { layout: Layout, metadata: Vec<u8> },

    /// Shut the torrent down.
    Quit,
}

/// Contract with the block cache / storage collaborator. The engine issues
/// these and never touches the disk itself. Errors come back as strings:
/// the engine only cares that a write failed, not why.
#[derive(Debug)]
pub enum CacheMsg {
    ReadBlock {
        info_hash: InfoHash,
        block: BlockInfo,
        recipient: oneshot::Sender<Result<bytes::Bytes, String>>,
    },
    WriteBlock {
        info_hash: InfoHash,
        block: Block,
        recipient: oneshot::Sender<Result<(), String>>,
    },
    Prefetch {
        info_hash: InfoHash,
        block: BlockInfo,
    },
    /// Are all blocks of this piece written?
    PieceComplete {
        info_hash: InfoHash,
        piece: usize,
        recipient: oneshot::Sender<bool>,
    },
    /// Verify a completed piece against its checksum.
    CheckPiece {
        info_hash: InfoHash,
        piece: usize,
        recipient: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatsKind {
    Up,
    Down,
    Corrupt,
}

/// Byte accounting handed to the announcer collaborator.
#[derive(Debug)]
pub enum StatsMsg {
    AddBytes { info_hash: InfoHash, kind: StatsKind, n: u64 },
}

/// Contract with the DHT collaborator, when one is wired in.
#[derive(Debug)]
pub enum DhtMsg {
    /// A peer advertised its DHT port.
    AddNode(SocketAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        // 3 pieces of 32 KiB, last piece 10 KiB
        Layout {
            piece_count: 3,
            piece_len: 32 * 1024,
            total_len: 2 * 32 * 1024 + 10 * 1024,
        }
    }

    #[test]
    fn piece_and_block_geometry() {
        let l = layout();
        assert_eq!(l.piece_size(0), 32 * 1024);
        assert_eq!(l.piece_size(2), 10 * 1024);
        assert_eq!(l.blocks_per_piece(), 2);
        assert_eq!(l.blocks_in_piece(0), 2);
        assert_eq!(l.blocks_in_piece(2), 1);

        // the final block of the final piece uses its computed short
        // length, not the nominal block size
        assert_eq!(l.block_len(2, 0), 10 * 1024);
        assert_eq!(l.block_info(2, 0), BlockInfo::new(2, 0, 10 * 1024));
        assert_eq!(l.block_len(0, 1), 16 * 1024);
    }

    #[test]
    fn block_index_is_global() {
        let l = layout();
        assert_eq!(l.block_index(&l.block_info(0, 0)), 0);
        assert_eq!(l.block_index(&l.block_info(0, 1)), 1);
        assert_eq!(l.block_index(&l.block_info(1, 0)), 2);
        assert_eq!(l.block_index(&l.block_info(2, 0)), 4);
    }

    #[test]
    fn contains_block_checks_boundaries() {
        let l = layout();
        assert!(l.contains_block(&BlockInfo::new(0, 0, 16384)));
        assert!(l.contains_block(&BlockInfo::new(2, 0, 10 * 1024)));
        // over the end of the short last piece
        assert!(!l.contains_block(&BlockInfo::new(2, 0, 16384)));
        // piece out of range
        assert!(!l.contains_block(&BlockInfo::new(3, 0, 16384)));
        // zero length
        assert!(!l.contains_block(&BlockInfo::new(0, 0, 0)));
    }
}
