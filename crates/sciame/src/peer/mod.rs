//! A remote peer in the network that downloads and uploads data.
//!
//! Each live connection runs one [`Peer<Connected>`] event loop: it parses
//! wire messages in receive order, batches outbound control traffic,
//! exchanges the extended handshake and its sub-protocols, and reports
//! everything the torrent needs to schedule requests and choke peers.
pub mod session;

mod request_manager;
mod types;

// re-exports
pub use request_manager::RequestManager;
pub use types::*;

use std::sync::atomic::Ordering;

use bendy::{decoding::FromBencode, encoding::ToBencode};
use futures::{SinkExt, StreamExt};
use tokio::{
    select, spawn,
    sync::{broadcast, oneshot},
    time::{interval, Duration, Instant},
};
use tracing::{debug, trace, warn};

use crate::{
    bitfield::{Bitfield, PieceField},
    error::Error,
    extensions::{
        Block, BlockInfo, Core, ExtendedMessage, Extension, Metadata,
        MetadataMsg, Pex, PexView, EXT_HANDSHAKE_ID, LOCAL_REQQ,
        METADATA_REQQ, UT_METADATA_ID, UT_PEX_ID,
    },
    torrent::{
        AtomSource, CacheMsg, PeerBrMsg, StatsKind, StatsMsg, TorrentMsg,
    },
};

/// Data about a remote peer that the client is connected to.
pub struct Peer<S: PeerState> {
    pub state: S,
}

impl Peer<Connected> {
    /// Start the event loop of the peer, listening to wire messages and to
    /// commands from the owning torrent.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.register().await?;
        self.send_extended_handshake().await?;
        self.send_availability().await?;

        self.state.session.connection = session::ConnectionState::Connected;

        // drain the outbound batch when its deadline passes, and keepalive
        let mut flush_interval = interval(Duration::from_millis(250));

        // top up the request pipeline
        let mut request_interval = interval(Duration::from_secs(1));

        // request metadata pieces while the info dict is missing
        let mut info_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                _ = flush_interval.tick() => {
                    self.flush_tick().await?;
                }
                _ = request_interval.tick(), if self.can_request() => {
                    self.maybe_request_more().await?;
                }
                _ = info_interval.tick(), if self.state.layout.is_none() => {
                    self.try_request_metadata().await?;
                }
                msg = self.state.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_msg(msg).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
                msg = self.state.rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if self.handle_cmd(msg).await? {
                        return Ok(());
                    }
                }
                msg = self.state.brx.recv() => {
                    match msg {
                        Ok(msg) => {
                            if self.handle_broadcast(msg).await? {
                                return Ok(());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} lagged {n} broadcasts", self.remote());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn remote(&self) -> std::net::SocketAddr {
        self.state.ctx.remote_addr
    }

    fn peer_supports_fast(&self) -> bool {
        // bit 61 counting from the left of the reserved bytes
        self.state.reserved[61]
    }

    fn peer_supports_extended(&self) -> bool {
        // bit 43 counting from the left of the reserved bytes
        self.state.reserved[43]
    }

    /// Announce ourselves to the torrent and pull the initial snapshot:
    /// piece geometry, our bitfield, and whether we're only seeding.
    async fn register(&mut self) -> Result<(), Error> {
        let (otx, orx) = oneshot::channel();
        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::PeerConnected {
                ctx: self.state.ctx.clone(),
                recipient: otx,
            })
            .await?;

        let sync = orx.await?;
        self.state.layout = sync.layout;
        self.state.metadata_size = sync.metadata_size;
        self.state.local_pieces = sync.local_pieces;
        self.state.session.seed_only = sync.upload_only;

        if let Some(layout) = &self.state.layout {
            self.state.pieces = PieceField::none(layout.piece_count);
        }

        Ok(())
    }

    /// The one moment a bitfield may be sent. With the fast extension the
    /// degenerate cases shrink to a single-byte message.
    async fn send_availability(&mut self) -> Result<(), Error> {
        let local = &self.state.local_pieces;

        if self.peer_supports_fast() {
            let msg = if local.is_all() {
                Core::HaveAll
            } else if local.count() == 0 {
                Core::HaveNone
            } else {
                Core::Bitfield(local.to_wire())
            };
            self.feed(msg, session::IMMEDIATE_PRIORITY).await?;
        } else if local.count() > 0 {
            self.feed(
                Core::Bitfield(local.to_wire()),
                session::IMMEDIATE_PRIORITY,
            )
            .await?;
        }

        Ok(())
    }

    /// Send our side of the BEP 10 handshake right after connecting.
    async fn send_extended_handshake(&mut self) -> Result<(), Error> {
        if !self.peer_supports_extended() {
            return Ok(());
        }

        // the metadata size is only advertised on public torrents
        let metadata_size = if self.state.torrent_ctx.private {
            None
        } else {
            self.state.metadata_size
        };

        let ext = Extension::supported(
            metadata_size,
            self.state.session.seed_only,
            None,
        );

        let payload = ext.to_bencode()?;
        debug!("{} sending extended handshake", self.remote());
        self.feed(
            Core::Extended(ExtendedMessage(
                EXT_HANDSHAKE_ID,
                payload,
            )),
            session::IMMEDIATE_PRIORITY,
        )
        .await
    }

    /// Append a message to the outbound buffer with a batch priority. A
    /// zero priority flushes the whole batch immediately.
    async fn feed(
        &mut self,
        msg: Core,
        priority: Duration,
    ) -> Result<(), Error> {
        self.state.sink.feed(msg).await?;
        if self.state.session.push_priority(priority, Instant::now()) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        self.state.sink.flush().await?;
        self.state.session.mark_flushed(Instant::now());
        Ok(())
    }

    /// Flush the batch once its deadline passes, and keep the link alive
    /// when nothing has been written for too long.
    async fn flush_tick(&mut self) -> Result<(), Error> {
        let now = Instant::now();

        if self.state.session.flush_due(now) {
            self.flush().await?;
        } else if self.state.session.batched_at.is_none()
            && self.state.session.keepalive_due(now)
        {
            self.state.sink.send(Core::KeepAlive).await?;
            self.state.session.last_write_at = Instant::now();
        }

        Ok(())
    }

    /// Check if we can request new blocks: we have the metadata, the peer
    /// doesn't choke us, we are interested, and we are not in seed-only
    /// mode.
    pub fn can_request(&self) -> bool {
        let am_interested =
            self.state.ctx.am_interested.load(Ordering::Relaxed);
        let peer_choking = self.state.ctx.peer_choking.load(Ordering::Relaxed);

        am_interested
            && !peer_choking
            && self.state.layout.is_some()
            && !self.state.session.seed_only
    }

    /// Ask the torrent for more blocks once the pipeline drains below the
    /// refill threshold.
    async fn maybe_request_more(&mut self) -> Result<(), Error> {
        let pending = self.state.outgoing_requests.len();
        if !self.state.session.should_refill(pending) {
            return Ok(());
        }

        let target = self.state.session.target_request_queue_len as usize;
        let numwant = target.saturating_sub(pending);
        if numwant == 0 {
            return Ok(());
        }

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::NeedBlocks { addr: self.remote(), numwant })
            .await?;

        Ok(())
    }

    /// Recompute the request-queue target from the observed rate. Runs on
    /// every choke flip and whenever reqq arrives.
    fn update_target_request_queue(&mut self) {
        let rate = self.state.ctx.counter.download_rate();
        let limit = self.state.torrent_ctx.download_limit;
        self.state.session.update_target_request_queue(rate, limit);
    }

    /// While the info dict is missing, ask any peer that advertised
    /// ut_metadata for the pieces of it, re-requesting stale ones.
    async fn try_request_metadata(&mut self) -> Result<(), Error> {
        let Some(ut_metadata) =
            self.state.ext.as_ref().and_then(|e| e.m.ut_metadata)
        else {
            return Ok(());
        };
        let Some(size) = self.state.metadata_size else {
            return Ok(());
        };

        const METADATA_SLOTS: usize = 4;
        const METADATA_TTL: Duration = Duration::from_secs(10);

        let now = Instant::now();

        // re-request timed out pieces
        let mut rerequest = Vec::new();
        for (piece, at) in self.state.outgoing_metadata_requests.iter_mut() {
            if now.duration_since(*at) >= METADATA_TTL {
                rerequest.push(*piece);
                *at = now;
            }
        }
        for piece in rerequest {
            self.send_metadata_request(ut_metadata, piece).await?;
        }

        // request new ones while there are free slots
        let total = Metadata::piece_count(size);
        for piece in 0..total {
            if self.state.outgoing_metadata_requests.len() >= METADATA_SLOTS {
                break;
            }
            if self
                .state
                .outgoing_metadata_requests
                .iter()
                .any(|(p, _)| *p == piece)
            {
                continue;
            }
            self.state.outgoing_metadata_requests.push((piece, now));
            self.send_metadata_request(ut_metadata, piece).await?;
        }

        Ok(())
    }

    async fn send_metadata_request(
        &mut self,
        ut_metadata: u8,
        piece: u32,
    ) -> Result<(), Error> {
        debug!("{} requesting metadata piece {piece}", self.remote());
        let payload =
            Metadata::request(piece).to_bencode()?;
        self.feed(
            Core::Extended(ExtendedMessage(
                ut_metadata,
                payload,
            )),
            session::HIGH_PRIORITY,
        )
        .await
    }

    /// Dispatch one wire message.
    async fn handle_msg(&mut self, msg: Core) -> Result<(), Error> {
        let remote = self.remote();

        match msg {
            Core::KeepAlive => {
                trace!("{remote} keepalive");
            }
            Core::Choke => self.handle_choke().await?,
            Core::Unchoke => self.handle_unchoke().await?,
            Core::Interested => {
                debug!("{remote} interested");
                self.state.ctx.peer_interested.store(true, Ordering::Relaxed);
            }
            Core::NotInterested => {
                debug!("{remote} not interested");
                self.state.ctx.peer_interested.store(false, Ordering::Relaxed);
            }
            Core::Have(piece) => self.handle_have(piece).await?,
            Core::Bitfield(raw) => self.handle_bitfield(raw).await?,
            Core::HaveAll => {
                self.require_fast()?;
                let len = self
                    .state
                    .layout
                    .as_ref()
                    .map(|l| l.piece_count)
                    .unwrap_or(self.state.pieces.len());
                self.state.pieces = PieceField::all(len);
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotHaveAll { addr: remote })
                    .await?;
            }
            Core::HaveNone => {
                self.require_fast()?;
                let len = self
                    .state
                    .layout
                    .as_ref()
                    .map(|l| l.piece_count)
                    .unwrap_or(self.state.pieces.len());
                self.state.pieces = PieceField::none(len);
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotHaveNone { addr: remote })
                    .await?;
            }
            Core::Request(info) => self.handle_request(info).await?,
            Core::Cancel(info) => {
                debug!("{remote} cancel {info:?}");
                if let Some(pos) = self
                    .state
                    .incoming_requests
                    .iter()
                    .position(|r| *r == info)
                {
                    self.state.incoming_requests.remove(pos);
                }
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotCancel { addr: remote })
                    .await?;
            }
            Core::Piece(block) => self.handle_piece(block).await?,
            Core::Reject(info) => {
                self.require_fast()?;
                debug!("{remote} rejected {info:?}");
                if self.state.outgoing_requests.remove(&info) {
                    self.state
                        .torrent_ctx
                        .tx
                        .send(TorrentMsg::GotReject { addr: remote, info })
                        .await?;
                }
            }
            Core::Port(port) => {
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotPort { addr: remote, port })
                    .await?;
            }
            Core::Suggest(piece) => {
                self.require_fast()?;
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotSuggest { addr: remote, piece })
                    .await?;
            }
            Core::AllowedFast(piece) => {
                self.require_fast()?;
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotAllowedFast { addr: remote, piece })
                    .await?;
            }
            Core::Extended(msg) => self.handle_extended(msg).await?,
        }

        Ok(())
    }

    /// Fast-extension messages from a peer that never advertised the fast
    /// extension are a protocol violation.
    fn require_fast(&self) -> Result<(), Error> {
        if self.peer_supports_fast() {
            Ok(())
        } else {
            Err(Error::FastExtensionDisabled)
        }
    }

    async fn handle_choke(&mut self) -> Result<(), Error> {
        debug!("{} choked us", self.remote());
        self.state.ctx.peer_choking.store(true, Ordering::Relaxed);
        self.update_target_request_queue();

        // without the fast extension a choke implicitly drops every pending
        // request; with it, the peer has to reject each one explicitly
        if !self.peer_supports_fast() {
            let blocks = self.state.outgoing_requests.drain();
            if !blocks.is_empty() {
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::ReturnBlocks {
                        addr: self.remote(),
                        blocks,
                    })
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_unchoke(&mut self) -> Result<(), Error> {
        debug!("{} unchoked us", self.remote());
        self.state.ctx.peer_choking.store(false, Ordering::Relaxed);
        self.update_target_request_queue();

        if self.can_request() {
            self.maybe_request_more().await?;
        }

        Ok(())
    }

    async fn handle_have(&mut self, piece: usize) -> Result<(), Error> {
        // with the metadata known the index is range-checked; before that
        // anything is stored and validated when the metadata arrives
        if let Some(layout) = &self.state.layout {
            if piece >= layout.piece_count {
                return Err(Error::BlockOutOfRange);
            }
        }

        // duplicates are ignored
        if self.state.pieces.has(piece) {
            return Ok(());
        }
        self.state.pieces.set(piece);

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::GotHave { addr: self.remote(), piece })
            .await?;

        Ok(())
    }

    async fn handle_bitfield(&mut self, raw: Bitfield) -> Result<(), Error> {
        let remote = self.remote();
        let raw_bytes = raw.len() / 8;

        match &self.state.layout {
            Some(layout) => {
                let expected = layout.piece_count.div_ceil(8);
                if raw_bytes != expected {
                    return Err(Error::BitfieldLength {
                        expected,
                        got: raw_bytes,
                    });
                }
            }
            None => {
                // no metadata yet: bound the frame by the advertised
                // metadata size, or by a fixed cap when there's no hint
                const MAX_HINTLESS_BITFIELD: usize = 8 * 1024;
                let cap = match self.state.metadata_size {
                    Some(hint) if hint > 0 => hint as usize,
                    _ => MAX_HINTLESS_BITFIELD,
                };
                if raw_bytes > cap {
                    return Err(Error::BitfieldLength {
                        expected: cap,
                        got: raw_bytes,
                    });
                }
            }
        }

        debug!("{remote} bitfield with {} pieces", raw.count_ones());

        let piece_count = self.state.layout.as_ref().map(|l| l.piece_count);
        self.state.pieces = PieceField::from_wire(raw, piece_count);

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::GotBitfield {
                addr: remote,
                pieces: self.state.pieces.clone(),
            })
            .await?;

        Ok(())
    }

    /// A request from the peer enters the incoming queue if it passes the
    /// gauntlet; otherwise it is rejected (fast extension) or dropped.
    async fn handle_request(&mut self, info: BlockInfo) -> Result<(), Error> {
        let remote = self.remote();
        let choked = self.state.ctx.am_choking.load(Ordering::Relaxed);

        let in_range = self
            .state
            .layout
            .as_ref()
            .map(|l| l.contains_block(&info))
            .unwrap_or(false);

        let acceptable = in_range
            && info.is_valid()
            && self.state.local_pieces.has(info.index as usize)
            && !choked
            && self.state.incoming_requests.len()
                < LOCAL_REQQ as usize
            && !self.state.incoming_requests.contains(&info);

        if !acceptable {
            debug!("{remote} dropping request {info:?} (choked: {choked})");
            if self.peer_supports_fast() {
                self.feed(Core::Reject(info), session::LOW_PRIORITY).await?;
            }
            return Ok(());
        }

        self.state.incoming_requests.push(info);

        // hand the read to the cache; the block comes back on our own
        // channel so the loop never blocks on disk
        let (otx, orx) = oneshot::channel();
        self.state
            .torrent_ctx
            .cache_tx
            .send(CacheMsg::ReadBlock {
                info_hash: self.state.ctx.info_hash.clone(),
                block: info,
                recipient: otx,
            })
            .await?;

        let tx = self.state.ctx.tx.clone();
        spawn(async move {
            match orx.await {
                Ok(Ok(data)) => {
                    let _ = tx
                        .send(PeerMsg::BlockRead(Block {
                            index: info.index as usize,
                            begin: info.begin,
                            block: data,
                        }))
                        .await;
                }
                Ok(Err(e)) => {
                    warn!("cache read failed for {info:?}: {e}");
                }
                Err(_) => {}
            }
        });

        Ok(())
    }

    /// A block arrived. Unsolicited or size-mismatched blocks are discarded
    /// without credit.
    async fn handle_piece(&mut self, block: Block) -> Result<(), Error> {
        let remote = self.remote();
        let info = block.info();

        if let Some(layout) = &self.state.layout {
            if !layout.contains_block(&info) {
                return Err(Error::BlockOutOfRange);
            }
        }

        if !self.state.outgoing_requests.remove(&info) {
            // either we never asked, the request was cancelled, or the size
            // doesn't match what we asked for
            warn!("{remote} sent a block we no longer want: {info:?}");
            return Ok(());
        }

        trace!("{remote} block {info:?}");

        self.state.ctx.counter.record_download(info.len as u64);
        let _ = self.state.torrent_ctx.stats_tx.send(StatsMsg::AddBytes {
            info_hash: self.state.ctx.info_hash.clone(),
            kind: StatsKind::Down,
            n: info.len as u64,
        });

        // a failed write may mean the disk is full, which has to close the
        // peer; the result comes back on our own channel
        let (otx, orx) = oneshot::channel();
        self.state
            .torrent_ctx
            .cache_tx
            .send(CacheMsg::WriteBlock {
                info_hash: self.state.ctx.info_hash.clone(),
                block,
                recipient: otx,
            })
            .await?;

        let tx = self.state.ctx.tx.clone();
        spawn(async move {
            if let Ok(Err(e)) = orx.await {
                let _ = tx.send(PeerMsg::CacheError(e)).await;
            }
        });

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::GotBlock { addr: remote, info })
            .await?;

        if self.can_request() {
            self.maybe_request_more().await?;
        }

        Ok(())
    }

    async fn handle_extended(
        &mut self,
        msg: ExtendedMessage,
    ) -> Result<(), Error> {
        let ExtendedMessage(ext_id, payload) = msg;
        let remote = self.remote();

        match ext_id {
            EXT_HANDSHAKE_ID => {
                let ext = Extension::from_bencode(&payload)?;
                debug!("{remote} extended handshake {ext:?}");

                if let Some(reqq) = ext.reqq {
                    self.state.session.peer_reqq = Some(reqq);
                    self.update_target_request_queue();
                }
                if self.state.metadata_size.is_none() {
                    self.state.metadata_size = ext.metadata_size;
                }

                self.state.ext = Some(ext.clone());

                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotExtendedHandshake {
                        addr: remote,
                        ext,
                    })
                    .await?;
            }
            UT_METADATA_ID => {
                let msg = MetadataMsg::parse(&payload)?;
                self.handle_metadata_msg(msg).await?;
            }
            UT_PEX_ID => {
                let pex = Pex::from_bencode(&payload)?;
                debug!(
                    "{remote} pex: {} added, {} dropped",
                    pex.added.len() + pex.added6.len(),
                    pex.dropped.len() + pex.dropped6.len()
                );

                let peers = pex
                    .all_added()
                    .map(|(addr, flags)| (*addr, *flags))
                    .collect::<Vec<_>>();

                if !peers.is_empty() {
                    self.state
                        .torrent_ctx
                        .tx
                        .send(TorrentMsg::AddPeers {
                            peers,
                            source: AtomSource::Pex,
                        })
                        .await?;
                }
            }
            other => {
                debug!("{remote} unknown extended id {other}");
            }
        }

        Ok(())
    }

    async fn handle_metadata_msg(
        &mut self,
        msg: MetadataMsg,
    ) -> Result<(), Error> {
        let remote = self.remote();

        match msg {
            MetadataMsg::Request(piece) => {
                let serveable = !self.state.torrent_ctx.private
                    && self.state.layout.is_some()
                    && self.state.pending_metadata_serves < METADATA_REQQ;

                let Some(ut_metadata) =
                    self.state.ext.as_ref().and_then(|e| e.m.ut_metadata)
                else {
                    return Ok(());
                };

                if !serveable {
                    debug!("{remote} rejecting metadata request {piece}");
                    let payload = Metadata::reject(piece).to_bencode()?;
                    self.feed(
                        Core::Extended(ExtendedMessage(
                            ut_metadata,
                            payload,
                        )),
                        session::HIGH_PRIORITY,
                    )
                    .await?;
                    return Ok(());
                }

                self.state.pending_metadata_serves += 1;

                let (otx, orx) = oneshot::channel();
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::RequestMetadataPiece {
                        piece,
                        recipient: otx,
                    })
                    .await?;

                let tx = self.state.ctx.tx.clone();
                spawn(async move {
                    let data = orx.await.unwrap_or(None);
                    let _ = tx
                        .send(PeerMsg::MetadataPiece { piece, data })
                        .await;
                });
            }
            MetadataMsg::Data(metadata, payload) => {
                debug!("{remote} metadata piece {}", metadata.piece);
                self.state
                    .outgoing_metadata_requests
                    .retain(|(p, _)| *p != metadata.piece);

                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotMetadataPiece {
                        piece: metadata.piece,
                        total_size: metadata.total_size,
                        payload,
                    })
                    .await?;
            }
            MetadataMsg::Reject(piece) => {
                debug!("{remote} rejected metadata piece {piece}");
                self.state
                    .outgoing_metadata_requests
                    .retain(|(p, _)| *p != piece);
            }
        }

        Ok(())
    }

    /// Commands from the owning torrent. Returns true when the loop should
    /// end.
    async fn handle_cmd(&mut self, msg: PeerMsg) -> Result<bool, Error> {
        let remote = self.remote();

        match msg {
            PeerMsg::RequestBlocks(blocks) => {
                for info in blocks {
                    self.state.outgoing_requests.add(info);
                    self.feed(
                        Core::Request(info),
                        session::IMMEDIATE_PRIORITY,
                    )
                    .await?;
                }
            }
            PeerMsg::CancelBlock(info) => {
                // cancelling is idempotent: only a live request emits a
                // Cancel on the wire
                if self.state.outgoing_requests.remove(&info) {
                    self.feed(
                        Core::Cancel(info),
                        session::IMMEDIATE_PRIORITY,
                    )
                    .await?;
                }
            }
            PeerMsg::HavePiece(piece) => {
                self.state.local_pieces.set(piece);
                if !self.state.pieces.has(piece) {
                    self.feed(Core::Have(piece), session::LOW_PRIORITY)
                        .await?;
                }
            }
            PeerMsg::Choke => {
                if !self.state.ctx.am_choking.swap(true, Ordering::Relaxed) {
                    debug!("{remote} choking");
                    // pending uploads die with the unchoke; fast peers get
                    // told, others infer it
                    let dropped: Vec<BlockInfo> =
                        self.state.incoming_requests.drain(..).collect();
                    self.feed(Core::Choke, session::IMMEDIATE_PRIORITY)
                        .await?;
                    if self.peer_supports_fast() {
                        for info in dropped {
                            self.feed(
                                Core::Reject(info),
                                session::LOW_PRIORITY,
                            )
                            .await?;
                        }
                    }
                }
            }
            PeerMsg::Unchoke => {
                if self.state.ctx.am_choking.swap(false, Ordering::Relaxed) {
                    debug!("{remote} unchoking");
                    self.feed(Core::Unchoke, session::IMMEDIATE_PRIORITY)
                        .await?;
                }
            }
            PeerMsg::Interested => {
                if !self.state.ctx.am_interested.swap(true, Ordering::Relaxed)
                {
                    debug!("{remote} sending interested");
                    self.feed(Core::Interested, session::IMMEDIATE_PRIORITY)
                        .await?;
                    self.update_target_request_queue();
                }
            }
            PeerMsg::NotInterested => {
                if self.state.ctx.am_interested.swap(false, Ordering::Relaxed)
                {
                    debug!("{remote} sending not interested");
                    self.feed(
                        Core::NotInterested,
                        session::IMMEDIATE_PRIORITY,
                    )
                    .await?;
                }
            }
            PeerMsg::HaveInfo { layout, metadata_size } => {
                self.state.layout = Some(layout);
                self.state.metadata_size = Some(metadata_size);
                self.state.outgoing_metadata_requests.clear();

                // peers that claimed pieces outside the torrent while the
                // metadata was unknown get disconnected now
                if !self.state.pieces.rebase(layout.piece_count) {
                    return Err(Error::BlockOutOfRange);
                }
                self.state.local_pieces.rebase(layout.piece_count);

                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::GotBitfield {
                        addr: remote,
                        pieces: self.state.pieces.clone(),
                    })
                    .await?;
            }
            PeerMsg::SeedOnly => {
                debug!("{remote} seed only");
                self.state.session.seed_only = true;
            }
            PeerMsg::BlockRead(block) => {
                self.send_block(block).await?;
            }
            PeerMsg::CacheError(e) => {
                return Err(Error::CacheIo(e));
            }
            PeerMsg::MetadataPiece { piece, data } => {
                self.state.pending_metadata_serves =
                    self.state.pending_metadata_serves.saturating_sub(1);
                self.send_metadata_piece(piece, data).await?;
            }
            PeerMsg::Purge | PeerMsg::Quit => {
                debug!("{remote} quitting");
                self.state.session.connection =
                    session::ConnectionState::Quitting;
                let _ = self.flush().await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Torrent-wide broadcasts. Returns true when the loop should end.
    async fn handle_broadcast(
        &mut self,
        msg: PeerBrMsg,
    ) -> Result<bool, Error> {
        match msg {
            PeerBrMsg::HavePiece(piece) => {
                self.state.local_pieces.set(piece);
                if !self.state.pieces.has(piece) {
                    self.feed(Core::Have(piece), session::LOW_PRIORITY)
                        .await?;
                }
            }
            PeerBrMsg::PexView(view) => {
                self.send_pex(&view).await?;
            }
            PeerBrMsg::Seedonly => {
                self.state.session.seed_only = true;
            }
            PeerBrMsg::Quit => {
                self.state.session.connection =
                    session::ConnectionState::Quitting;
                let _ = self.flush().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Send the diff between the swarm view we last told this peer about
    /// and the current one.
    async fn send_pex(
        &mut self,
        view: &PexView,
    ) -> Result<(), Error> {
        let Some(ut_pex) = self.state.ext.as_ref().and_then(|e| e.m.ut_pex)
        else {
            return Ok(());
        };

        let mut current = view.clone();
        // never gossip the peer its own address
        current.remove(&self.remote());

        let delta =
            Pex::delta(&self.state.session.pex_view, &current);
        if delta.is_empty() {
            return Ok(());
        }

        trace!(
            "{} pex delta: +{} -{}",
            self.remote(),
            delta.added.len() + delta.added6.len(),
            delta.dropped.len() + delta.dropped6.len()
        );

        let payload = delta.to_bencode()?;
        self.feed(
            Core::Extended(ExtendedMessage(
                ut_pex, payload,
            )),
            session::HIGH_PRIORITY,
        )
        .await?;

        self.state.session.pex_view = current;

        Ok(())
    }

    /// A block came back from the cache for an incoming request. If the
    /// request is still queued, the piece payload bypasses the batch and is
    /// written immediately.
    async fn send_block(&mut self, block: Block) -> Result<(), Error> {
        let info = block.info();

        let Some(pos) =
            self.state.incoming_requests.iter().position(|r| *r == info)
        else {
            // cancelled while the read was in flight
            trace!("{} dropping read for cancelled {info:?}", self.remote());
            return Ok(());
        };
        self.state.incoming_requests.remove(pos);

        let len = info.len as u64;
        self.state.sink.send(Core::Piece(block)).await?;
        self.state.session.last_write_at = Instant::now();

        self.state.ctx.counter.record_upload(len);
        let _ = self.state.torrent_ctx.stats_tx.send(StatsMsg::AddBytes {
            info_hash: self.state.ctx.info_hash.clone(),
            kind: StatsKind::Up,
            n: len,
        });

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::SentPieceData {
                addr: self.remote(),
                len: info.len,
            })
            .await?;

        Ok(())
    }

    async fn send_metadata_piece(
        &mut self,
        piece: u32,
        data: Option<(u32, Vec<u8>)>,
    ) -> Result<(), Error> {
        let Some(ut_metadata) =
            self.state.ext.as_ref().and_then(|e| e.m.ut_metadata)
        else {
            return Ok(());
        };

        let payload = match data {
            Some((total_size, bytes)) => {
                debug!("{} serving metadata piece {piece}", self.remote());
                Metadata::data(piece, total_size, &bytes)?
            }
            None => {
                debug!("{} rejecting metadata piece {piece}", self.remote());
                Metadata::reject(piece).to_bencode()?
            }
        };

        self.feed(
            Core::Extended(ExtendedMessage(
                ut_metadata,
                payload,
            )),
            session::HIGH_PRIORITY,
        )
        .await
    }
}
