//! The session-level manager: it owns the torrent registry, accepts
//! incoming connections and routes them to the right torrent, and holds the
//! collaborators every torrent shares (blocklist, cache, stats, DHT).

use std::{
    net::{IpAddr, SocketAddr},
    sync::{atomic::AtomicU32, Arc},
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    config::CONFIG,
    error::Error,
    extensions::PexFlags,
    peer::{Peer, PeerId},
    torrent::{
        AtomSource, CacheMsg, DhtMsg, InfoHash, Layout, StatsMsg, Torrent,
        TorrentCtx, TorrentMeta, TorrentMsg,
    },
};

/// The blocklist collaborator. Lookups are cached per atom, keyed by the
/// generation, so implementations should bump it whenever the underlying
/// list changes.
pub trait Blocklist: Send + Sync {
    fn contains(&self, ip: &IpAddr) -> bool;
    fn generation(&self) -> u64;
}

/// The default blocklist: blocks nothing.
#[derive(Debug, Default)]
pub struct NoBlocklist;

impl Blocklist for NoBlocklist {
    fn contains(&self, _ip: &IpAddr) -> bool {
        false
    }
    fn generation(&self) -> u64 {
        0
    }
}

/// Notifications the engine pushes up to the embedding application.
#[derive(Debug)]
pub enum EngineEvent {
    /// A magnet torrent finished downloading its metadata. The application
    /// verifies the blob against the info hash, parses it, and calls
    /// [`ManagerMsg::GotMetadata`] with the piece geometry.
    MetadataAssembled { info_hash: InfoHash, metadata: Vec<u8> },

    /// Every wanted piece arrived and verified.
    TorrentCompleted { info_hash: InfoHash },
}

/// Context of the manager shared with torrents and handshake tasks.
#[derive(Debug)]
pub struct ManagerCtx {
    pub tx: mpsc::Sender<ManagerMsg>,

    /// Our own peer id, sent on every handshake.
    pub local_peer_id: PeerId,

    /// Connected peers across all torrents, read by every torrent when it
    /// enforces the session cap.
    pub global_peers: AtomicU32,

    pub blocklist: Arc<dyn Blocklist>,

    pub events_tx: mpsc::UnboundedSender<EngineEvent>,

    /// Wired in when the application runs a DHT.
    pub dht_tx: Option<mpsc::UnboundedSender<DhtMsg>>,
}

impl std::fmt::Debug for dyn Blocklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blocklist(gen {})", self.generation())
    }
}

/// Messages driving the manager.
#[derive(Debug)]
pub enum ManagerMsg {
    /// Register a torrent and start its engine. Replies with the handle
    /// peers and the application use to talk to it.
    AddTorrent(TorrentMeta, oneshot::Sender<Arc<TorrentCtx>>),

    /// Stop and unregister a torrent.
    RemoveTorrent(InfoHash),

    /// Stop a torrent's engine but keep it registered.
    Stop(InfoHash),

    /// Restart a stopped torrent.
    Start(InfoHash),

    /// The application parsed and verified an assembled metadata blob.
    GotMetadata { info_hash: InfoHash, layout: Layout, metadata: Vec<u8> },

    /// Feed endpoints to a torrent (tracker response, resume file, LPD...).
    AddPeers {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
        source: AtomSource,
    },

    /// Resolve a torrent handle by info hash, used by inbound handshakes.
    GetTorrentCtx(InfoHash, oneshot::Sender<Option<Arc<TorrentCtx>>>),

    /// An inbound handshake finished, successfully or not.
    InboundDone(SocketAddr),

    /// Shut the whole engine down.
    Quit,
}

struct TorrentHandle {
    ctx: Arc<TorrentCtx>,
    meta: TorrentMeta,
    running: bool,
}

/// The engine's root object. The embedding application constructs one,
/// spawns [`Manager::run`], and from then on talks to it over the ctx.
pub struct Manager {
    pub ctx: Arc<ManagerCtx>,

    rx: mpsc::Receiver<ManagerMsg>,
    torrents: HashMap<InfoHash, TorrentHandle>,

    /// Addresses with an incoming handshake in flight.
    incoming_handshakes: HashSet<SocketAddr>,

    cache_tx: mpsc::Sender<CacheMsg>,
    stats_tx: mpsc::UnboundedSender<StatsMsg>,
}

impl Manager {
    /// Wire the engine to its collaborators. Returns the receiving end of
    /// the event stream for the application.
    pub fn new(
        cache_tx: mpsc::Sender<CacheMsg>,
        stats_tx: mpsc::UnboundedSender<StatsMsg>,
        blocklist: Arc<dyn Blocklist>,
        dht_tx: Option<mpsc::UnboundedSender<DhtMsg>>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel::<ManagerMsg>(300);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(ManagerCtx {
            tx,
            local_peer_id: PeerId::gen(),
            global_peers: AtomicU32::new(0),
            blocklist,
            events_tx,
            dht_tx,
        });

        (
            Self {
                ctx,
                rx,
                torrents: HashMap::new(),
                incoming_handshakes: HashSet::new(),
                cache_tx,
                stats_tx,
            },
            events_rx,
        )
    }

    /// Accept loop plus the manager message pipe.
    pub async fn run(&mut self) -> Result<(), Error> {
        let ip = if CONFIG.is_ipv6 { "::" } else { "0.0.0.0" };
        let listener =
            TcpListener::bind((ip, CONFIG.local_peer_port)).await?;
        info!("listening for peers on {}", listener.local_addr()?);

        loop {
            select! {
                accepted = listener.accept() => {
                    if let Ok((socket, addr)) = accepted {
                        self.gate_incoming(socket, addr);
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_msg(msg).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// The incoming connection gate: blocklisted addresses and duplicates
    /// of an in-flight handshake are closed on the spot, everything else
    /// starts an inbound handshake.
    fn gate_incoming(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.ctx.blocklist.contains(&addr.ip()) {
            debug!("{addr} is blocklisted, refusing");
            return;
        }

        if !self.incoming_handshakes.insert(addr) {
            debug!("{addr} already has a handshake in flight, refusing");
            return;
        }

        debug!("{addr} accepted, handshaking");

        let manager_ctx = self.ctx.clone();
        let local_peer_id = self.ctx.local_peer_id.clone();

        spawn(async move {
            let peer = Peer::new();
            match peer
                .inbound_handshake(socket, local_peer_id, manager_ctx.clone())
                .await
            {
                Ok(mut peer) => {
                    // handshake done: the wire session takes over, and the
                    // manager's in-flight slot frees up
                    let _ = manager_ctx
                        .tx
                        .send(ManagerMsg::InboundDone(addr))
                        .await;

                    let torrent_tx = peer.state.torrent_ctx.tx.clone();
                    let result = peer.run().await;
                    if let Err(e) = &result {
                        warn!("{addr} peer loop ended with an error: {e}");
                    }
                    let _ = torrent_tx
                        .send(TorrentMsg::PeerClosed {
                            addr,
                            graceful: result.is_ok(),
                            read_anything: true,
                        })
                        .await;
                }
                Err(e) => {
                    debug!("{addr} inbound handshake failed: {e}");
                    let _ = manager_ctx
                        .tx
                        .send(ManagerMsg::InboundDone(addr))
                        .await;
                }
            }
        });
    }

    /// Build and spawn a torrent's event loop.
    fn spawn_torrent(&self, meta: TorrentMeta) -> Arc<TorrentCtx> {
        let mut torrent = Torrent::new(
            meta,
            self.ctx.clone(),
            self.cache_tx.clone(),
            self.stats_tx.clone(),
        );
        let ctx = torrent.ctx.clone();

        spawn(async move {
            if let Err(e) = torrent.run().await {
                warn!("torrent loop ended with an error: {e}");
            }
        });

        ctx
    }

    /// Returns true when the manager should shut down.
    async fn handle_msg(&mut self, msg: ManagerMsg) -> Result<bool, Error> {
        match msg {
            ManagerMsg::AddTorrent(meta, recipient) => {
                let info_hash = meta.info_hash.clone();

                if let Some(handle) = self.torrents.get(&info_hash) {
                    debug!("{info_hash:?} is already registered");
                    let _ = recipient.send(handle.ctx.clone());
                    return Ok(false);
                }

                let ctx = self.spawn_torrent(meta.clone());
                self.torrents.insert(
                    info_hash,
                    TorrentHandle { ctx: ctx.clone(), meta, running: true },
                );
                let _ = recipient.send(ctx);
            }
            ManagerMsg::RemoveTorrent(info_hash) => {
                if let Some(handle) = self.torrents.remove(&info_hash) {
                    let _ = handle.ctx.tx.send(TorrentMsg::Quit).await;
                }
            }
            ManagerMsg::Stop(info_hash) => {
                if let Some(handle) = self.torrents.get_mut(&info_hash) {
                    if handle.running {
                        handle.running = false;
                        let _ = handle.ctx.tx.send(TorrentMsg::Quit).await;
                    }
                }
            }
            ManagerMsg::Start(info_hash) => {
                let meta = match self.torrents.get(&info_hash) {
                    Some(handle) if !handle.running => handle.meta.clone(),
                    _ => return Ok(false),
                };
                let ctx = self.spawn_torrent(meta);
                if let Some(handle) = self.torrents.get_mut(&info_hash) {
                    handle.ctx = ctx;
                    handle.running = true;
                }
            }
            ManagerMsg::GotMetadata { info_hash, layout, metadata } => {
                if let Some(handle) = self.torrents.get_mut(&info_hash) {
                    handle.meta.layout = Some(layout);
                    handle.meta.metadata = Some(metadata.clone());
                    let _ = handle
                        .ctx
                        .tx
                        .send(TorrentMsg::GotMetadata { layout, metadata })
                        .await;
                }
            }
            ManagerMsg::AddPeers { info_hash, peers, source } => {
                if let Some(handle) = self.torrents.get(&info_hash) {
                    let peers = peers
                        .into_iter()
                        .map(|addr| (addr, PexFlags::default()))
                        .collect();
                    let _ = handle
                        .ctx
                        .tx
                        .send(TorrentMsg::AddPeers { peers, source })
                        .await;
                }
            }
            ManagerMsg::GetTorrentCtx(info_hash, recipient) => {
                let ctx = self
                    .torrents
                    .get(&info_hash)
                    .filter(|handle| handle.running)
                    .map(|handle| handle.ctx.clone());
                let _ = recipient.send(ctx);
            }
            ManagerMsg::InboundDone(addr) => {
                self.incoming_handshakes.remove(&addr);
            }
            ManagerMsg::Quit => {
                info!("shutting the engine down");
                for handle in self.torrents.values() {
                    let _ = handle.ctx.tx.send(TorrentMsg::Quit).await;
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}
