//! A torrent's peer engine: one event loop owning the endpoint pool, the
//! live connections, the request ledger, and the choke controller.
//!
//! Peers send every wire-level event here over [`TorrentMsg`]; four
//! periodic pulses (reconnect every 500 ms, rechoke and request upkeep
//! every 10 s, pool ageing every 60 s) drive the decisions in between.

pub mod choker;
pub mod picker;
pub mod pool;

mod types;

// re-exports
pub use picker::Picker;
pub use pool::{Atom, AtomFlags, AtomSource, CandidateCriteria, Pool};
pub use types::*;

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::{broadcast, mpsc, oneshot},
    time::{interval, interval_at, timeout, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    bitfield::PieceField,
    config::CONFIG,
    error::Error,
    extensions::{BlockInfo, Extension, Metadata, PexFlags, PexView},
    manager::{EngineEvent, ManagerCtx},
    peer::{session::PEX_INTERVAL, Direction, Peer, PeerCtx, PeerMsg},
    torrent::choker::{
        ChokeCandidate, Choker, InterestCandidate, PeerHistories,
        CANCEL_HISTORY_SECS,
    },
};

/// Strikes before an endpoint is banned for serving corrupt data.
const MAX_BAD_PIECES_PER_PEER: u8 = 5;

/// New outbound dials allowed per reconnect pulse: 12 per second at a
/// half-second pulse.
const MAX_CONNECTIONS_PER_PULSE: usize = 6;

/// Outbound TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds two seeds stay connected when PEX still has value.
const SEED_TO_SEED_SECS: u64 = 30;

/// Idle-disconnect bounds: the threshold slides between these depending on
/// how full the torrent's connection table is.
const MIN_IDLE_SECS: u64 = 60;
const MAX_IDLE_SECS: u64 = 60 * 5;

/// A peer that delivered piece data this recently is mid-transfer and is
/// skipped by the timed cancellation sweep.
const MID_RECEIVE_GRACE: Duration = Duration::from_secs(3);

/// A torrent counts as recently started this long, which boosts its
/// connection candidates.
const RECENTLY_STARTED_SECS: u64 = 120;

/// Everything the torrent tracks about one live connection.
struct PeerRecord {
    ctx: Arc<PeerCtx>,
    /// The torrent's copy of the peer's claimed pieces.
    have: PieceField,
    /// Pieces this peer contributed bytes to, for strike accounting.
    blame: PieceField,
    strikes: u8,
    do_purge: bool,
    /// A purge command is already on its way.
    purge_sent: bool,
    connected_at: Instant,
    piece_data_at: Option<Instant>,
    histories: PeerHistories,
    ext: Option<Extension>,
    upload_only: bool,
}

impl PeerRecord {
    fn new(ctx: Arc<PeerCtx>) -> Self {
        Self {
            ctx,
            have: PieceField::default(),
            blame: PieceField::default(),
            strikes: 0,
            do_purge: false,
            purge_sent: false,
            connected_at: Instant::now(),
            piece_data_at: None,
            histories: PeerHistories::default(),
            ext: None,
            upload_only: false,
        }
    }

    fn is_seed(&self) -> bool {
        self.upload_only || (!self.have.is_empty() && self.have.is_all())
    }

    /// The address peers should be told to reach this peer on: inbound
    /// connections arrive from an ephemeral port, the listen port comes
    /// from the extended handshake.
    fn advertised_addr(&self) -> SocketAddr {
        match self.ext.as_ref().and_then(|e| e.p) {
            Some(port) => SocketAddr::new(self.ctx.remote_addr.ip(), port),
            None => self.ctx.remote_addr,
        }
    }
}

/// Reassembly buffer for a metadata download (BEP 9).
struct MetadataAssembly {
    total_size: u32,
    have: Vec<bool>,
    buf: Vec<u8>,
}

impl MetadataAssembly {
    fn new(total_size: u32) -> Self {
        Self {
            total_size,
            have: vec![false; Metadata::piece_count(total_size) as usize],
            buf: vec![0; total_size as usize],
        }
    }

    fn is_complete(&self) -> bool {
        self.have.iter().all(|h| *h)
    }
}

/// This is the main entity responsible for the high-level management of
/// a torrent download or upload.
pub struct Torrent {
    pub name: String,
    pub ctx: Arc<TorrentCtx>,

    manager_ctx: Arc<ManagerCtx>,
    rx: mpsc::Receiver<TorrentMsg>,
    meta: TorrentMeta,
    status: TorrentStatus,
    started_at: Instant,

    pool: Pool,
    /// None until the metadata is known.
    picker: Option<Picker>,
    choker: Choker,

    peers: HashMap<SocketAddr, PeerRecord>,
    outgoing_handshakes: HashSet<SocketAddr>,

    /// The raw info dict, served over ut_metadata.
    metadata: Option<Vec<u8>>,
    /// In-flight metadata download when we started from a magnet link.
    assembly: Option<MetadataAssembly>,

    webseeds: Vec<String>,
}

impl Torrent {
    pub fn new(
        meta: TorrentMeta,
        manager_ctx: Arc<ManagerCtx>,
        cache_tx: mpsc::Sender<CacheMsg>,
        stats_tx: mpsc::UnboundedSender<StatsMsg>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<TorrentMsg>(300);
        let (btx, _) = broadcast::channel::<PeerBrMsg>(300);

        let ctx = Arc::new(TorrentCtx {
            tx,
            btx,
            cache_tx,
            stats_tx,
            info_hash: meta.info_hash.clone(),
            private: meta.private,
            download_limit: meta.download_limit,
        });

        let picker = meta.layout.map(|layout| {
            let have = meta
                .have_pieces
                .clone()
                .unwrap_or_else(|| PieceField::none(layout.piece_count));
            Picker::new(layout, have, meta.piece_priorities.clone())
        });

        let status = match &picker {
            Some(p) if p.have().is_all() => TorrentStatus::Seeding,
            _ => TorrentStatus::Downloading,
        };

        Self {
            name: meta.name.clone(),
            ctx,
            manager_ctx,
            rx,
            status,
            started_at: Instant::now(),
            pool: Pool::new(),
            picker,
            choker: Choker::new(),
            peers: HashMap::new(),
            outgoing_handshakes: HashSet::new(),
            metadata: meta.metadata.clone(),
            assembly: None,
            webseeds: meta.webseeds.clone(),
            meta,
        }
    }

    /// The torrent event loop: timers plus the message pipe from peers and
    /// the manager.
    pub async fn run(&mut self) -> Result<(), Error> {
        info!("starting torrent {:?}", self.name);

        let now = Instant::now();

        // try to connect to new peers, cull dead ones
        let mut reconnect_interval = interval(Duration::from_millis(500));

        // choke/unchoke and interest decisions
        let mut rechoke_interval = interval_at(
            now + Duration::from_secs(10),
            Duration::from_secs(10),
        );

        // cancel stale requests, re-evaluate endgame
        let mut refill_interval = interval_at(
            now + Duration::from_secs(10),
            Duration::from_secs(10),
        );

        // shrink the endpoint pool towards its cap
        let mut atom_interval =
            interval_at(now + Duration::from_secs(60), Duration::from_secs(60));

        // gossip the swarm view to PEX-speaking peers
        let mut pex_interval = interval_at(now + PEX_INTERVAL, PEX_INTERVAL);

        // refresh the transfer-rate counters
        let mut heartbeat_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                _ = reconnect_interval.tick() => {
                    self.reconnect_pulse();
                }
                _ = rechoke_interval.tick() => {
                    self.rechoke_pulse().await;
                }
                _ = refill_interval.tick() => {
                    self.refill_upkeep().await;
                }
                _ = atom_interval.tick() => {
                    self.atom_pulse();
                }
                _ = pex_interval.tick(), if !self.meta.private => {
                    self.pex_pulse();
                }
                _ = heartbeat_interval.tick() => {
                    for record in self.peers.values() {
                        record.ctx.counter.update_rates();
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

        info!("torrent {:?} stopped", self.name);
        Ok(())
    }

    fn max_peers(&self) -> usize {
        self.meta
            .max_connected_peers
            .unwrap_or(CONFIG.max_torrent_peers) as usize
    }

    fn metadata_size(&self) -> Option<u32> {
        self.metadata
            .as_ref()
            .map(|m| m.len() as u32)
            .or_else(|| self.assembly.as_ref().map(|a| a.total_size))
    }

    fn seeding(&self) -> bool {
        self.status == TorrentStatus::Seeding
    }

    /// Peers actively delivering blocks plus webseeds, the denominator of
    /// the endgame factor.
    fn active_downloaders(&self) -> usize {
        let Some(picker) = &self.picker else { return 0 };
        self.peers
            .keys()
            .filter(|addr| picker.pending_for(addr) > 0)
            .count()
            + self.webseeds.len()
    }

    /// One dispatch site for everything that happens to this torrent.
    /// Returns true when the loop should stop.
    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<bool, Error> {
        match msg {
            TorrentMsg::PeerConnected { ctx, recipient } => {
                self.on_peer_connected(ctx, recipient);
            }
            TorrentMsg::PeerClosed { addr, graceful, read_anything } => {
                self.on_peer_closed(addr, graceful, read_anything);
            }
            TorrentMsg::ConnectFailed { addr, read_anything } => {
                trace!("connect to {addr} failed");
                self.outgoing_handshakes.remove(&addr);
                self.pool.mark_closed(&addr, false, read_anything);
            }
            TorrentMsg::GotBitfield { addr, pieces } => {
                self.on_bitfield(addr, pieces);
            }
            TorrentMsg::GotHave { addr, piece } => {
                if let Some(record) = self.peers.get_mut(&addr) {
                    record.have.set(piece);
                    if let Some(picker) = &mut self.picker {
                        picker.inc_replication(piece);
                    }
                }
                self.update_seed_probability(&addr);
            }
            TorrentMsg::GotHaveAll { addr } => {
                let len = self.layout_len();
                if let Some(record) = self.peers.get_mut(&addr) {
                    let new_len = len.max(record.have.len());
                    let old = std::mem::replace(&mut record.have, PieceField::all(new_len));
                    let new = record.have.clone();
                    if let Some(picker) = &mut self.picker {
                        picker.replace_replication(&old, &new);
                    }
                }
                self.update_seed_probability(&addr);
            }
            TorrentMsg::GotHaveNone { addr } => {
                let len = self.layout_len();
                if let Some(record) = self.peers.get_mut(&addr) {
                    let new_len = len.max(record.have.len());
                    let old = std::mem::replace(&mut record.have, PieceField::none(new_len));
                    let new = record.have.clone();
                    if let Some(picker) = &mut self.picker {
                        picker.replace_replication(&old, &new);
                    }
                }
                self.update_seed_probability(&addr);
            }
            TorrentMsg::GotBlock { addr, info } => {
                self.on_block(addr, info).await;
            }
            TorrentMsg::GotReject { addr, info } => {
                if let Some(picker) = &mut self.picker {
                    picker.remove_request(&info, &addr);
                }
            }
            TorrentMsg::GotCancel { addr } => {
                if let Some(record) = self.peers.get_mut(&addr) {
                    record.histories.cancels_to_client.add(1);
                }
            }
            TorrentMsg::ReturnBlocks { addr, blocks } => {
                if let Some(picker) = &mut self.picker {
                    for info in blocks {
                        picker.remove_request(&info, &addr);
                    }
                }
            }
            TorrentMsg::GotSuggest { addr, piece } => {
                trace!("{addr} suggests piece {piece}");
            }
            TorrentMsg::GotAllowedFast { addr, piece } => {
                trace!("{addr} allows fast piece {piece}");
            }
            TorrentMsg::GotPort { addr, port } => {
                if let Some(dht_tx) = &self.manager_ctx.dht_tx {
                    let _ = dht_tx.send(DhtMsg::AddNode(SocketAddr::new(
                        addr.ip(),
                        port,
                    )));
                }
            }
            TorrentMsg::GotExtendedHandshake { addr, ext } => {
                self.on_extended_handshake(addr, ext);
            }
            TorrentMsg::NeedBlocks { addr, numwant } => {
                self.on_need_blocks(addr, numwant).await;
            }
            TorrentMsg::SentPieceData { addr, len: _ } => {
                if let Some(record) = self.peers.get_mut(&addr) {
                    record.piece_data_at = Some(Instant::now());
                    record.histories.blocks_to_peer.add(1);
                }
                self.pool.on_piece_data(&addr);
            }
            TorrentMsg::GotMetadataPiece { piece, total_size, payload } => {
                self.on_metadata_piece(piece, total_size, payload);
            }
            TorrentMsg::RequestMetadataPiece { piece, recipient } => {
                let _ = recipient.send(self.metadata_slice(piece));
            }
            TorrentMsg::AddPeers { peers, source } => {
                debug!("adding {} peers from {source:?}", peers.len());
                for (addr, flags) in peers {
                    self.pool.ensure(addr, source, Some(flags));
                }
            }
            TorrentMsg::PieceChecked { piece, ok } => {
                self.on_piece_checked(piece, ok).await;
            }
            TorrentMsg::GotMetadata { layout, metadata } => {
                self.on_metadata(layout, metadata).await;
            }
            TorrentMsg::Quit => {
                info!("quitting torrent {:?}", self.name);
                let _ = self.ctx.btx.send(PeerBrMsg::Quit);
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn layout_len(&self) -> usize {
        self.meta.layout.map(|l| l.piece_count).unwrap_or(0)
    }

    fn on_peer_connected(
        &mut self,
        ctx: Arc<PeerCtx>,
        recipient: oneshot::Sender<PeerSyncInfo>,
    ) {
        let addr = ctx.remote_addr;
        debug!("{addr} connected ({:?})", ctx.direction);

        self.outgoing_handshakes.remove(&addr);

        // an incoming connection is itself a discovery; outbound peers were
        // dialed from the pool and already have their atom
        if ctx.direction == Direction::Inbound {
            self.pool.ensure(addr, AtomSource::Incoming, None);
        }
        self.pool.mark_connected(&addr, ctx.id.clone());
        self.manager_ctx.global_peers.fetch_add(1, Ordering::Relaxed);

        let local_pieces = self
            .picker
            .as_ref()
            .map(|p| p.have().clone())
            .unwrap_or_default();

        let _ = recipient.send(PeerSyncInfo {
            layout: self.meta.layout,
            metadata_size: self.metadata_size(),
            local_pieces,
            upload_only: self.seeding(),
        });

        self.peers.insert(addr, PeerRecord::new(ctx));
    }

    fn on_peer_closed(
        &mut self,
        addr: SocketAddr,
        graceful: bool,
        read_anything: bool,
    ) {
        debug!("{addr} closed (graceful: {graceful})");
        self.outgoing_handshakes.remove(&addr);

        if let Some(record) = self.peers.remove(&addr) {
            if let Some(picker) = &mut self.picker {
                picker.sub_replication(&record.have);
                picker.remove_peer(&addr);
            }
            self.choker.forget_peer(&addr);
            self.manager_ctx.global_peers.fetch_sub(1, Ordering::Relaxed);
        }

        // the atom outlives the connection, remembering how it went
        self.pool.mark_closed(&addr, graceful, read_anything);
    }

    fn on_bitfield(&mut self, addr: SocketAddr, pieces: PieceField) {
        if let Some(record) = self.peers.get_mut(&addr) {
            let old = std::mem::replace(&mut record.have, pieces);
            if let Some(picker) = &mut self.picker {
                picker.replace_replication(&old, &record.have);
            }
        }
        self.update_seed_probability(&addr);
    }

    fn update_seed_probability(&mut self, addr: &SocketAddr) {
        if self.meta.layout.is_none() {
            return;
        }
        let Some(record) = self.peers.get(addr) else { return };
        let progress = record.have.progress();
        if let Some(atom) = self.pool.get_mut(addr) {
            atom.set_seed_probability((progress * 100.0).round() as u8);
        }
    }

    async fn on_block(&mut self, addr: SocketAddr, info: BlockInfo) {
        if let Some(record) = self.peers.get_mut(&addr) {
            record.piece_data_at = Some(Instant::now());
            record.histories.blocks_to_client.add(1);
            record.blame.set(info.index as usize);
        }
        self.pool.on_piece_data(&addr);

        let Some(picker) = &mut self.picker else { return };

        let Some((racers, piece_done)) = picker.block_received(&addr, &info)
        else {
            // duplicate completion, not credited
            return;
        };

        // the race is over, everyone else gets a cancel
        for racer in racers {
            if let Some(record) = self.peers.get_mut(&racer) {
                record.histories.cancels_to_peer.add(1);
                let _ = record
                    .ctx
                    .tx
                    .send(PeerMsg::CancelBlock(info))
                    .await;
            }
        }

        if piece_done {
            self.check_piece(info.index as usize);
        }
    }

    /// The last block of a piece landed: have the cache verify it, and
    /// route the verdict back into the loop.
    fn check_piece(&self, piece: usize) {
        let (otx, orx) = oneshot::channel();
        let cache_tx = self.ctx.cache_tx.clone();
        let tx = self.ctx.tx.clone();
        let info_hash = self.ctx.info_hash.clone();

        spawn(async move {
            let sent = cache_tx
                .send(CacheMsg::CheckPiece { info_hash, piece, recipient: otx })
                .await;
            if sent.is_err() {
                return;
            }
            if let Ok(ok) = orx.await {
                let _ = tx.send(TorrentMsg::PieceChecked { piece, ok }).await;
            }
        });
    }

    async fn on_piece_checked(&mut self, piece: usize, ok: bool) {
        let Some(picker) = &mut self.picker else { return };

        if ok {
            debug!("piece {piece} verified");
            picker.piece_checked_ok(piece);
            let _ = self.ctx.btx.send(PeerBrMsg::HavePiece(piece));

            if picker.have().is_all() {
                info!("{:?} downloaded fully, seeding now", self.name);
                self.status = TorrentStatus::Seeding;
                let _ = self.ctx.btx.send(PeerBrMsg::Seedonly);
                let _ = self
                    .manager_ctx
                    .events_tx
                    .send(EngineEvent::TorrentCompleted {
                        info_hash: self.ctx.info_hash.clone(),
                    });
            }
            return;
        }

        warn!("piece {piece} failed verification");
        picker.piece_failed(piece);

        let piece_len = self
            .meta
            .layout
            .map(|l| l.piece_size(piece) as u64)
            .unwrap_or(0);
        let _ = self.ctx.stats_tx.send(StatsMsg::AddBytes {
            info_hash: self.ctx.info_hash.clone(),
            kind: StatsKind::Corrupt,
            n: piece_len,
        });

        // everyone who fed bytes into the bad piece takes a strike; too
        // many strikes ban the endpoint outright
        let mut banned = Vec::new();
        for (addr, record) in self.peers.iter_mut() {
            if !record.blame.has(piece) {
                continue;
            }
            record.strikes = record.strikes.saturating_add(1);
            debug!("{addr} strike {} for piece {piece}", record.strikes);
            if record.strikes >= MAX_BAD_PIECES_PER_PEER {
                record.do_purge = true;
                banned.push(*addr);
            }
        }
        for addr in banned {
            self.pool.ban(&addr);
        }
    }

    fn on_extended_handshake(&mut self, addr: SocketAddr, ext: Extension) {
        let listen_addr = {
            let Some(record) = self.peers.get_mut(&addr) else { return };
            record.upload_only = ext.upload_only.unwrap_or(false);
            record.ext = Some(ext.clone());
            record.advertised_addr()
        };

        if let Some(atom) = self.pool.get_mut(&addr) {
            atom.flags.encryption |= ext.e == Some(1);
            atom.flags.utp |= ext.supports_utp();
            atom.flags.holepunch |= ext.m.ut_holepunch.is_some();
        }

        // an inbound peer's listen endpoint is itself worth remembering
        if listen_addr != addr {
            self.pool.ensure(listen_addr, AtomSource::Ltep, None);
        }
    }

    async fn on_need_blocks(&mut self, addr: SocketAddr, numwant: usize) {
        if self.seeding() {
            return;
        }
        let Some(picker) = &mut self.picker else { return };
        let Some(record) = self.peers.get(&addr) else { return };

        let downloaders = {
            // count peers with at least one pending request
            let mut n = self.webseeds.len();
            for peer in self.peers.keys() {
                if picker.pending_for(peer) > 0 {
                    n += 1;
                }
            }
            n
        };
        picker.update_endgame(downloaders);

        let blocks = picker.assign(addr, &record.have, numwant);
        if blocks.is_empty() {
            return;
        }

        trace!("{addr} gets {} blocks", blocks.len());
        let _ = record.ctx.tx.send(PeerMsg::RequestBlocks(blocks)).await;
    }

    fn on_metadata_piece(
        &mut self,
        piece: u32,
        total_size: Option<u32>,
        payload: Vec<u8>,
    ) {
        if self.meta.layout.is_some() {
            return;
        }

        let Some(size) = total_size
            .or_else(|| self.assembly.as_ref().map(|a| a.total_size))
        else {
            return;
        };

        let assembly = self
            .assembly
            .get_or_insert_with(|| MetadataAssembly::new(size));

        let Some(range) = Metadata::piece_range(assembly.total_size, piece)
        else {
            return;
        };
        if payload.len() != range.len() {
            warn!("metadata piece {piece} has a bogus length, ignoring");
            return;
        }
        if assembly.have[piece as usize] {
            return;
        }

        assembly.buf[range].copy_from_slice(&payload);
        assembly.have[piece as usize] = true;

        if assembly.is_complete() {
            info!("metadata download complete ({} bytes)", assembly.total_size);
            // the embedding application parses and verifies the dict, then
            // calls back with the piece geometry
            let blob = std::mem::take(&mut self.assembly)
                .map(|a| a.buf)
                .unwrap_or_default();
            let _ = self.manager_ctx.events_tx.send(
                EngineEvent::MetadataAssembled {
                    info_hash: self.ctx.info_hash.clone(),
                    metadata: blob,
                },
            );
        }
    }

    fn metadata_slice(&self, piece: u32) -> Option<(u32, Vec<u8>)> {
        if self.meta.private {
            return None;
        }
        let metadata = self.metadata.as_ref()?;
        let total = metadata.len() as u32;
        let range = Metadata::piece_range(total, piece)?;
        Some((total, metadata[range].to_vec()))
    }

    /// The metadata arrived (from the wire via the embedding application,
    /// or late from a .torrent file): build the picker, re-anchor every
    /// peer, and refresh their progress.
    async fn on_metadata(&mut self, layout: Layout, metadata: Vec<u8>) {
        if self.meta.layout.is_some() {
            return;
        }

        info!("{:?} got its metadata: {} pieces", self.name, layout.piece_count);
        self.meta.layout = Some(layout);
        let metadata_size = metadata.len() as u32;
        self.metadata = Some(metadata);
        self.assembly = None;

        let mut picker = Picker::new(
            layout,
            PieceField::none(layout.piece_count),
            self.meta.piece_priorities.clone(),
        );

        // re-anchor the per-peer fields and rebuild replication; peers
        // whose claims don't fit the torrent will disconnect themselves
        // when they fail the same rebase
        for record in self.peers.values_mut() {
            if record.have.rebase(layout.piece_count) {
                picker.add_replication(&record.have);
            } else {
                record.have = PieceField::none(layout.piece_count);
                record.do_purge = true;
            }
            record.blame.rebase(layout.piece_count);
        }

        self.picker = Some(picker);

        for record in self.peers.values() {
            let _ = record
                .ctx
                .tx
                .send(PeerMsg::HaveInfo { layout, metadata_size })
                .await;
        }

        for addr in self.peers.keys().copied().collect::<Vec<_>>() {
            self.update_seed_probability(&addr);
        }
    }

    // -- the four pulses --------------------------------------------------

    /// Every 500 ms: enforce connection caps, drop dead peers, dial new
    /// candidates.
    fn reconnect_pulse(&mut self) {
        self.enforce_caps();
        self.close_dead_peers();
        self.dial_candidates();
    }

    /// Liveliness order for culling, worst first: purged, then slower,
    /// then longest since piece data, then longest connected.
    fn worst_peers(&self) -> Vec<SocketAddr> {
        let mut ranked: Vec<(bool, u64, Instant, Instant, SocketAddr)> = self
            .peers
            .iter()
            .map(|(addr, r)| {
                let speed = r.ctx.counter.download_rate()
                    + r.ctx.counter.upload_rate();
                (
                    r.do_purge,
                    speed,
                    r.piece_data_at.unwrap_or(r.connected_at),
                    r.connected_at,
                    *addr,
                )
            })
            .collect();

        ranked.sort_unstable_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });

        ranked.into_iter().map(|(_, _, _, _, addr)| addr).collect()
    }

    fn purge(&mut self, addr: &SocketAddr) {
        if let Some(record) = self.peers.get_mut(addr) {
            record.do_purge = true;
            if !record.purge_sent {
                record.purge_sent = true;
                let tx = record.ctx.tx.clone();
                spawn(async move {
                    let _ = tx.send(PeerMsg::Purge).await;
                });
            }
        }
    }

    fn enforce_caps(&mut self) {
        // per-torrent cap
        let over = self.peers.len().saturating_sub(self.max_peers());
        if over > 0 {
            for addr in self.worst_peers().into_iter().take(over) {
                debug!("{addr} over the torrent cap, closing");
                self.purge(&addr);
            }
        }

        // session cap, enforced with this torrent's worst peers
        let global =
            self.manager_ctx.global_peers.load(Ordering::Relaxed) as usize;
        let over = global.saturating_sub(CONFIG.max_global_peers as usize);
        if over > 0 {
            for addr in self.worst_peers().into_iter().take(over) {
                debug!("{addr} over the session cap, closing");
                self.purge(&addr);
            }
        }
    }

    fn close_dead_peers(&mut self) {
        let now = Instant::now();
        let seeding = self.seeding();
        let peer_count = self.peers.len();
        let max_peers = self.max_peers();
        let private = self.meta.private;

        let mut to_close = Vec::new();

        for (addr, record) in &self.peers {
            if record.do_purge {
                to_close.push(*addr);
                continue;
            }

            // two seeds only have PEX gossip to offer each other
            if seeding && record.is_seed() {
                let last_activity = record
                    .piece_data_at
                    .unwrap_or(record.connected_at);
                if private
                    || now.duration_since(last_activity).as_secs()
                        >= SEED_TO_SEED_SECS
                {
                    to_close.push(*addr);
                    continue;
                }
            }

            // idle disconnect on a sliding threshold: the emptier the
            // connection table, the quicker we give up on a silent peer
            let fullness = (peer_count as f64
                / (max_peers as f64 * 0.9).max(1.0))
            .min(1.0);
            let limit = MIN_IDLE_SECS
                + ((MAX_IDLE_SECS - MIN_IDLE_SECS) as f64 * fullness) as u64;

            let last = record.piece_data_at.unwrap_or(record.connected_at);
            if now.duration_since(last).as_secs() > limit {
                debug!("{addr} idle past {limit}s, closing");
                to_close.push(*addr);
            }
        }

        for addr in to_close {
            self.purge(&addr);
        }
    }

    fn dial_candidates(&mut self) {
        let torrent_room =
            self.max_peers().saturating_sub(
                self.peers.len() + self.outgoing_handshakes.len(),
            );
        let global = self.manager_ctx.global_peers.load(Ordering::Relaxed);
        let global_room =
            (CONFIG.max_global_peers as usize).saturating_sub(global as usize);

        let want = torrent_room
            .min(global_room)
            .min(MAX_CONNECTIONS_PER_PULSE);
        if want == 0 {
            return;
        }

        let mut in_flight: HashSet<SocketAddr> =
            self.peers.keys().copied().collect();
        in_flight.extend(self.outgoing_handshakes.iter().copied());

        let criteria = CandidateCriteria {
            seeding: self.seeding(),
            recently_started: self.started_at.elapsed().as_secs()
                < RECENTLY_STARTED_SECS,
            priority: self.meta.priority,
        };

        let picked = self.pool.candidates(
            criteria,
            &in_flight,
            self.manager_ctx.blocklist.as_ref(),
            want,
        );

        for addr in picked {
            self.outgoing_handshakes.insert(addr);
            self.pool.mark_attempt(&addr);
            self.dial(addr);
        }
    }

    /// Open an outbound connection and run the wire session to completion,
    /// reporting how it ended either way.
    fn dial(&self, addr: SocketAddr) {
        let torrent_ctx = self.ctx.clone();
        let tx = self.ctx.tx.clone();
        let local_peer_id = self.manager_ctx.local_peer_id.clone();

        debug!("dialing {addr}");

        spawn(async move {
            let socket =
                match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
                {
                    Ok(Ok(socket)) => socket,
                    _ => {
                        let _ = tx
                            .send(TorrentMsg::ConnectFailed {
                                addr,
                                read_anything: false,
                            })
                            .await;
                        return;
                    }
                };

            let peer = Peer::new();
            match peer
                .outbound_handshake(socket, local_peer_id, torrent_ctx)
                .await
            {
                Ok(mut peer) => {
                    let result = peer.run().await;
                    if let Err(e) = &result {
                        warn!("{addr} peer loop ended with an error: {e}");
                    }
                    let _ = tx
                        .send(TorrentMsg::PeerClosed {
                            addr,
                            graceful: result.is_ok(),
                            read_anything: true,
                        })
                        .await;
                }
                Err(e) => {
                    debug!("{addr} handshake failed: {e}");
                    let read_anything =
                        !matches!(e, Error::HandshakeTimeout | Error::IO(_));
                    let _ = tx
                        .send(TorrentMsg::ConnectFailed { addr, read_anything })
                        .await;
                }
            }
        });
    }

    /// Every 10 s: who do we serve, who do we beg from.
    async fn rechoke_pulse(&mut self) {
        if self.peers.is_empty() {
            return;
        }

        // upload side
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .map(|(addr, r)| {
                let rate = match (self.seeding(), self.meta.private) {
                    (true, _) => r.ctx.counter.upload_rate(),
                    (false, true) => {
                        r.ctx.counter.upload_rate()
                            + r.ctx.counter.download_rate()
                    }
                    (false, false) => r.ctx.counter.download_rate(),
                };
                ChokeCandidate {
                    addr: *addr,
                    peer_interested: r
                        .ctx
                        .peer_interested
                        .load(Ordering::Relaxed),
                    was_unchoked: !r.ctx.am_choking.load(Ordering::Relaxed),
                    rate,
                    is_seed: r.is_seed(),
                    connected_at: r.connected_at,
                }
            })
            .collect();

        let up_rate: u64 =
            self.peers.values().map(|r| r.ctx.counter.upload_rate()).sum();
        let saturated = CONFIG.upload_rate_limit > 0
            && up_rate >= CONFIG.upload_rate_limit;
        let choke_all = !self.meta.upload_allowed;

        let decisions = self.choker.rechoke_uploads(
            &candidates,
            choke_all,
            saturated,
            CONFIG.upload_slots_per_torrent as usize,
        );

        for (addr, unchoke) in decisions {
            if let Some(record) = self.peers.get(&addr) {
                let msg =
                    if unchoke { PeerMsg::Unchoke } else { PeerMsg::Choke };
                let _ = record.ctx.tx.send(msg).await;
            }
        }

        // download side: who is worth being interested in
        let candidates: Vec<InterestCandidate> = self
            .peers
            .iter()
            .map(|(addr, r)| InterestCandidate {
                addr: *addr,
                interesting: !self.seeding()
                    && self
                        .picker
                        .as_ref()
                        .map(|p| p.peer_is_interesting(&r.have))
                        .unwrap_or(false),
                blocks: r
                    .histories
                    .blocks_to_client
                    .count(CANCEL_HISTORY_SECS),
                cancels: r
                    .histories
                    .cancels_to_peer
                    .count(CANCEL_HISTORY_SECS),
            })
            .collect();

        let decisions =
            self.choker.rechoke_interest(&candidates, self.max_peers());

        for (addr, interested) in decisions {
            if let Some(record) = self.peers.get(&addr) {
                let msg = if interested {
                    PeerMsg::Interested
                } else {
                    PeerMsg::NotInterested
                };
                let _ = record.ctx.tx.send(msg).await;
            }
        }
    }

    /// Every 10 s: cancel requests that sat in the ledger too long, unless
    /// the peer is actively delivering, and refresh the endgame factor.
    async fn refill_upkeep(&mut self) {
        let downloaders = self.active_downloaders();
        let Some(picker) = &mut self.picker else { return };

        // the stored replication should match a re-derivation from the
        // connected peers; misbehaving peers may introduce drift, which is
        // why this only fires in debug builds
        picker.assert_replication(self.peers.values().map(|r| &r.have));

        picker.update_endgame(downloaders);

        let now = Instant::now();
        let peers = &self.peers;
        let cancelled = picker.timed_cancel(now, |addr| {
            peers
                .get(addr)
                .and_then(|r| r.piece_data_at)
                .map(|at| now.duration_since(at) < MID_RECEIVE_GRACE)
                .unwrap_or(false)
        });

        for (addr, info) in cancelled {
            debug!("request {info:?} to {addr} timed out, cancelling");
            if let Some(record) = self.peers.get_mut(&addr) {
                record.histories.cancels_to_peer.add(1);
                let _ = record.ctx.tx.send(PeerMsg::CancelBlock(info)).await;
            }
        }
    }

    /// Every 60 s: prune the endpoint pool down towards its size cap.
    fn atom_pulse(&mut self) {
        let mut in_flight: HashSet<SocketAddr> =
            self.peers.keys().copied().collect();
        in_flight.extend(self.outgoing_handshakes.iter().copied());
        self.pool.age(self.max_peers() as u32, &in_flight);
    }

    /// Every 90 s: broadcast the swarm view; each peer diffs it against
    /// what it last sent.
    fn pex_pulse(&mut self) {
        let mut view = PexView::new();

        for record in self.peers.values() {
            let addr = record.advertised_addr();
            let atom_flags = self
                .pool
                .get(&record.ctx.remote_addr)
                .map(|a| a.flags)
                .unwrap_or_default();
            view.insert(
                addr,
                PexFlags {
                    encryption: atom_flags.encryption,
                    seed: record.is_seed(),
                    utp: atom_flags.utp,
                    holepunch: atom_flags.holepunch,
                    connectable: atom_flags.connectable.unwrap_or(false),
                },
            );
        }

        trace!("pex view has {} peers", view.len());
        let _ = self.ctx.btx.send(PeerBrMsg::PexView(Arc::new(view)));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::atomic::{AtomicBool, AtomicU32},
    };

    use super::*;
    use crate::{
        counter::Counter,
        extensions::BLOCK_LEN,
        manager::{ManagerMsg, NoBlocklist},
        peer::{Direction, PeerId},
    };

    fn manager_ctx() -> Arc<ManagerCtx> {
        let (tx, _rx) = mpsc::channel::<ManagerMsg>(10);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        Arc::new(ManagerCtx {
            tx,
            local_peer_id: PeerId::gen(),
            global_peers: AtomicU32::new(0),
            blocklist: Arc::new(NoBlocklist),
            events_tx,
            dht_tx: None,
        })
    }

    fn test_meta(piece_count: usize) -> TorrentMeta {
        TorrentMeta {
            info_hash: InfoHash([1u8; 20]),
            name: "test".into(),
            layout: Some(Layout {
                piece_count,
                piece_len: BLOCK_LEN,
                total_len: piece_count as u64 * BLOCK_LEN as u64,
            }),
            metadata: None,
            private: false,
            piece_priorities: None,
            have_pieces: None,
            download_limit: 0,
            max_connected_peers: None,
            priority: TorrentPriority::Normal,
            upload_allowed: true,
            webseeds: Vec::new(),
        }
    }

    fn peer_ctx(addr: SocketAddr) -> (Arc<PeerCtx>, mpsc::Receiver<PeerMsg>) {
        let (tx, rx) = mpsc::channel(10);
        let ctx = Arc::new(PeerCtx {
            tx,
            id: PeerId::gen(),
            direction: Direction::Outbound,
            remote_addr: addr,
            local_addr: "127.0.0.1:0".parse().unwrap(),
            info_hash: InfoHash([1u8; 20]),
            counter: Counter::new(),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        });
        (ctx, rx)
    }

    #[tokio::test]
    async fn repeated_corruption_bans_the_peer() {
        let (cache_tx, _cache_rx) = mpsc::channel(10);
        let (stats_tx, _stats_rx) = mpsc::unbounded_channel();
        let mut torrent =
            Torrent::new(test_meta(5), manager_ctx(), cache_tx, stats_tx);

        let addr: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881);
        let (ctx, _rx) = peer_ctx(addr);

        let (otx, orx) = oneshot::channel();
        torrent
            .handle_msg(TorrentMsg::PeerConnected { ctx, recipient: otx })
            .await
            .unwrap();
        orx.await.unwrap();

        // the peer contributed bytes to five pieces, all of which turn out
        // corrupt
        for piece in 0..5 {
            torrent.peers.get_mut(&addr).unwrap().blame.set(piece);
        }
        for piece in 0..5 {
            assert!(!torrent.pool.is_banned(&addr));
            torrent
                .handle_msg(TorrentMsg::PieceChecked { piece, ok: false })
                .await
                .unwrap();
        }

        assert!(torrent.pool.is_banned(&addr));
        assert!(torrent.peers.get(&addr).unwrap().do_purge);

        // a banned endpoint is never a connect candidate again
        torrent
            .handle_msg(TorrentMsg::PeerClosed {
                addr,
                graceful: true,
                read_anything: true,
            })
            .await
            .unwrap();
        let picked = torrent.pool.candidates(
            CandidateCriteria {
                seeding: false,
                recently_started: true,
                priority: TorrentPriority::Normal,
            },
            &HashSet::new(),
            &NoBlocklist,
            10,
        );
        assert!(picked.is_empty());
    }

    #[tokio::test]
    async fn replication_follows_peers() {
        let (cache_tx, _cache_rx) = mpsc::channel(10);
        let (stats_tx, _stats_rx) = mpsc::unbounded_channel();
        let mut torrent =
            Torrent::new(test_meta(4), manager_ctx(), cache_tx, stats_tx);

        let addr: SocketAddr =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6881);
        let (ctx, _rx) = peer_ctx(addr);

        let (otx, orx) = oneshot::channel();
        torrent
            .handle_msg(TorrentMsg::PeerConnected { ctx, recipient: otx })
            .await
            .unwrap();
        orx.await.unwrap();

        torrent
            .handle_msg(TorrentMsg::GotHave { addr, piece: 2 })
            .await
            .unwrap();
        assert_eq!(torrent.picker.as_ref().unwrap().replication(2), 1);

        torrent
            .handle_msg(TorrentMsg::GotHaveAll { addr })
            .await
            .unwrap();
        let picker = torrent.picker.as_ref().unwrap();
        for piece in 0..4 {
            assert_eq!(picker.replication(piece), 1);
        }

        // the peer's claims leave with it
        torrent
            .handle_msg(TorrentMsg::PeerClosed {
                addr,
                graceful: true,
                read_anything: true,
            })
            .await
            .unwrap();
        let picker = torrent.picker.as_ref().unwrap();
        for piece in 0..4 {
            assert_eq!(picker.replication(piece), 0);
        }
    }
}
