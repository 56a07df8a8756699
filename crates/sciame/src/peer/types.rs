use std::{
    fmt::Display,
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    bitfield::{PieceField, Reserved},
    counter::Counter,
    error::Error,
    extensions::{
        Block, BlockInfo, Core, CoreCodec, Extension, Handshake,
        HandshakeCodec,
    },
    manager::{ManagerCtx, ManagerMsg},
    peer::{self, request_manager::RequestManager, session::Session},
    torrent::{InfoHash, Layout, PeerBrMsg, TorrentCtx},
};

/// How long we wait for the remote's handshake before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn gen() -> Self {
        let mut peer_id = [0; 20];
        peer_id[..8].copy_from_slice(b"-SC0010-");

        for b in peer_id.iter_mut().skip(8) {
            *b = rand::rng().sample(Alphanumeric);
        }

        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Ctx of a live connection, shared with the torrent that owns it. The
/// torrent reads the atomics and the counter when it rechokes, culls, and
/// ranks peers; everything else goes through `tx`.
#[derive(Debug)]
pub struct PeerCtx {
    pub tx: mpsc::Sender<PeerMsg>,

    /// Id the remote sent on its handshake.
    pub id: PeerId,

    pub direction: Direction,

    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,

    /// The info_hash of the torrent that this peer belongs to.
    pub info_hash: InfoHash,

    /// Piece-data transfer accounting for this connection.
    pub counter: Counter,

    /// If we choke the peer, we don't allow them to download pieces from us.
    pub am_choking: AtomicBool,

    /// If we're interested, the peer has pieces that we don't have.
    pub am_interested: AtomicBool,

    /// If the peer chokes us, we may not download pieces from them.
    pub peer_choking: AtomicBool,

    /// If the peer is interested in us, they mean to download pieces that we
    /// have.
    pub peer_interested: AtomicBool,
}

/// Commands the torrent sends to one of its peers.
#[derive(Debug)]
pub enum PeerMsg {
    /// Request these blocks from the peer. The torrent already entered them
    /// into its ledger.
    RequestBlocks(Vec<BlockInfo>),

    /// Send a Cancel for a block we requested previously, either because it
    /// timed out or because another peer delivered it first.
    CancelBlock(BlockInfo),

    /// We completed a piece, announce it unless the peer already has it.
    HavePiece(usize),

    /// Choke the peer.
    Choke,

    /// Unchoke the peer.
    Unchoke,

    /// Declare interest in the peer.
    Interested,

    /// Withdraw interest.
    NotInterested,

    /// The torrent finished downloading the info dict, or it was known all
    /// along and this is the initial sync.
    HaveInfo { layout: Layout, metadata_size: u32 },

    /// The torrent is complete, stop requesting and only seed.
    SeedOnly,

    /// A block the cache read back for serving an incoming request.
    BlockRead(Block),

    /// The cache failed to write a block we handed it.
    CacheError(String),

    /// A metadata piece the torrent looked up for us, None meaning we don't
    /// serve it.
    MetadataPiece { piece: u32, data: Option<(u32, Vec<u8>)> },

    /// The torrent wants this connection gone.
    Purge,

    /// Graceful shutdown of the peer task.
    Quit,
}

/// A peer can be: Idle, Connected, or Error.
pub trait PeerState {}

/// An endpoint we may handshake at any moment, not yet connected.
#[derive(Clone, Default)]
pub struct Idle {}

impl peer::Peer<Idle> {
    pub fn new() -> Self {
        Self { state: Idle {} }
    }

    /// Open an outbound connection: we know which torrent the peer belongs
    /// to, send the first handshake and validate the reply.
    pub async fn outbound_handshake(
        self,
        socket: TcpStream,
        local_peer_id: PeerId,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<peer::Peer<Connected>, Error> {
        let remote = socket.peer_addr()?;
        let local = socket.local_addr()?;

        let mut socket = Framed::new(socket, HandshakeCodec);

        let our_handshake =
            Handshake::new(torrent_ctx.info_hash.clone(), local_peer_id);

        debug!("{remote} sending the first handshake");
        socket.send(our_handshake.clone()).await?;

        let peer_handshake =
            match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Ok(Some(Ok(handshake))) => handshake,
                Ok(_) => return Err(Error::HandshakeInvalid),
                Err(_) => return Err(Error::HandshakeTimeout),
            };

        if !our_handshake.validate(&peer_handshake) {
            return Err(Error::HandshakeInvalid);
        }

        Ok(into_connected(
            socket,
            peer_handshake,
            torrent_ctx,
            Direction::Outbound,
            remote,
            local,
        ))
    }

    /// Accept an inbound connection: the remote sends the first handshake,
    /// which names the torrent it wants; the manager's registry resolves it.
    pub async fn inbound_handshake(
        self,
        socket: TcpStream,
        local_peer_id: PeerId,
        manager_ctx: Arc<ManagerCtx>,
    ) -> Result<peer::Peer<Connected>, Error> {
        let remote = socket.peer_addr()?;
        let local = socket.local_addr()?;

        let mut socket = Framed::new(socket, HandshakeCodec);

        let peer_handshake =
            match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Ok(Some(Ok(handshake))) => handshake,
                Ok(_) => return Err(Error::HandshakeInvalid),
                Err(_) => return Err(Error::HandshakeTimeout),
            };

        let (otx, orx) = oneshot::channel();
        manager_ctx
            .tx
            .send(ManagerMsg::GetTorrentCtx(
                peer_handshake.info_hash.clone(),
                otx,
            ))
            .await?;

        let Some(torrent_ctx) = orx.await? else {
            warn!("{remote} asked for a torrent we don't have");
            return Err(Error::TorrentDoesNotExist);
        };

        let our_handshake =
            Handshake::new(peer_handshake.info_hash.clone(), local_peer_id);

        if !our_handshake.validate(&peer_handshake) {
            return Err(Error::HandshakeInvalid);
        }

        debug!("{remote} replying to inbound handshake");
        socket.send(our_handshake).await?;

        Ok(into_connected(
            socket,
            peer_handshake,
            torrent_ctx,
            Direction::Inbound,
            remote,
            local,
        ))
    }
}

/// Switch the codec from handshakes to wire messages, keeping any buffered
/// bytes, and assemble the connected peer.
fn into_connected(
    socket: Framed<TcpStream, HandshakeCodec>,
    peer_handshake: Handshake,
    torrent_ctx: Arc<TorrentCtx>,
    direction: Direction,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> peer::Peer<Connected> {
    let reserved = Reserved::from(peer_handshake.reserved);

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
    // reuse buffers of previous codec, the remote may have already sent
    // bytes past its handshake
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(new_parts);

    let (tx, rx) = mpsc::channel::<PeerMsg>(100);
    let brx = torrent_ctx.btx.subscribe();

    let ctx = PeerCtx {
        tx,
        id: peer_handshake.peer_id,
        direction,
        remote_addr,
        local_addr,
        info_hash: torrent_ctx.info_hash.clone(),
        counter: Counter::new(),
        am_choking: AtomicBool::new(true),
        am_interested: AtomicBool::new(false),
        peer_choking: AtomicBool::new(true),
        peer_interested: AtomicBool::new(false),
    };

    let (sink, stream) = socket.split();

    peer::Peer {
        state: Connected {
            sink,
            stream,
            reserved,
            torrent_ctx,
            rx,
            brx,
            ctx: Arc::new(ctx),
            session: Session::default(),
            pieces: PieceField::default(),
            local_pieces: PieceField::default(),
            ext: None,
            outgoing_requests: RequestManager::new(),
            incoming_requests: Vec::new(),
            pending_metadata_serves: 0,
            outgoing_metadata_requests: Vec::new(),
            layout: None,
            metadata_size: None,
        },
    }
}

/// Peer is connected, downloading and uploading.
pub struct Connected {
    pub stream: futures::stream::SplitStream<Framed<TcpStream, CoreCodec>>,
    pub sink: futures::stream::SplitSink<Framed<TcpStream, CoreCodec>, Core>,

    /// Reserved bits the remote sent on its handshake.
    pub reserved: Reserved,

    pub torrent_ctx: Arc<TorrentCtx>,
    pub rx: mpsc::Receiver<PeerMsg>,
    pub brx: broadcast::Receiver<PeerBrMsg>,

    /// Context of the peer which is shared with the owning torrent.
    pub ctx: Arc<PeerCtx>,

    /// Connection-local state: batching deadline, request queue target,
    /// seed-only flag, and friends.
    pub session: Session,

    /// The pieces the remote claims to have.
    pub pieces: PieceField,

    /// Cached copy of our own bitfield, kept current by `HavePiece`
    /// commands. Used to answer requests without asking the torrent.
    pub local_pieces: PieceField,

    /// The extended handshake the remote sent, if any.
    pub ext: Option<Extension>,

    /// Blocks we asked the peer for and haven't received yet.
    pub outgoing_requests: RequestManager,

    /// Blocks the peer asked us for, oldest first, capped at
    /// [`crate::extensions::LOCAL_REQQ`].
    pub incoming_requests: Vec<BlockInfo>,

    /// Metadata piece reads in flight for this peer, capped at
    /// [`crate::extensions::METADATA_REQQ`].
    pub pending_metadata_serves: usize,

    /// Metadata pieces we asked this peer for, with the time of the request
    /// so stale ones get asked again.
    pub outgoing_metadata_requests: Vec<(u32, tokio::time::Instant)>,

    /// Piece geometry of the torrent, None until the metadata is known.
    pub layout: Option<Layout>,

    /// Metadata size hint from the extended handshake, used to bound
    /// hint-only bitfields and to request metadata pieces.
    pub metadata_size: Option<u32>,
}

impl PeerState for Idle {}
impl PeerState for Connected {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_shape() {
        let id = PeerId::gen();
        assert_eq!(&id.0[..8], b"-SC0010-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }
}
