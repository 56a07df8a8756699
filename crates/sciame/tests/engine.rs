//! End-to-end tests driving the engine over loopback TCP with a
//! hand-rolled remote peer on the other side of the socket.

use std::{
    net::SocketAddr,
    sync::{
        atomic::AtomicU32,
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use sciame::{
    bitfield::Bitfield,
    extensions::{
        Block, Core, CoreCodec, Handshake, HandshakeCodec, BLOCK_LEN,
    },
    manager::{EngineEvent, ManagerCtx, ManagerMsg, NoBlocklist},
    peer::{Peer, PeerId},
    torrent::{
        AtomSource, CacheMsg, InfoHash, Layout, StatsMsg, Torrent,
        TorrentCtx, TorrentMeta, TorrentMsg, TorrentPriority,
    },
};

const INFO_HASH: [u8; 20] = [3u8; 20];

/// Pipe engine logs into the test harness; `RUST_LOG=sciame=debug` makes a
/// failing scenario readable.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn layout(piece_count: usize) -> Layout {
    Layout {
        piece_count,
        piece_len: BLOCK_LEN,
        total_len: piece_count as u64 * BLOCK_LEN as u64,
    }
}

fn meta(piece_count: usize) -> TorrentMeta {
    TorrentMeta {
        info_hash: InfoHash(INFO_HASH),
        name: "engine-test".into(),
        layout: Some(layout(piece_count)),
        metadata: Some(vec![7u8; 64]),
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

/// A block cache over two in-memory buffers: reads serve `expected`,
/// writes land in `store`, and a piece checks out when the stored bytes
/// equal the expected ones.
fn spawn_cache(
    expected: Arc<Vec<u8>>,
    store: Arc<Mutex<Vec<u8>>>,
    layout: Layout,
) -> mpsc::Sender<CacheMsg> {
    let (tx, mut rx) = mpsc::channel::<CacheMsg>(100);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                CacheMsg::ReadBlock { block, recipient, .. } => {
                    let start = block.index as usize
                        * layout.piece_len as usize
                        + block.begin as usize;
                    let end = start + block.len as usize;
                    let _ = recipient.send(Ok(Bytes::copy_from_slice(
                        &expected[start..end],
                    )));
                }
                CacheMsg::WriteBlock { block, recipient, .. } => {
                    let start = block.index * layout.piece_len as usize
                        + block.begin as usize;
                    let mut store = store.lock().unwrap();
                    store[start..start + block.block.len()]
                        .copy_from_slice(&block.block);
                    let _ = recipient.send(Ok(()));
                }
                CacheMsg::CheckPiece { piece, recipient, .. } => {
                    let start = piece * layout.piece_len as usize;
                    let end = (start + layout.piece_len as usize)
                        .min(layout.total_len as usize);
                    let ok = store.lock().unwrap()[start..end]
                        == expected[start..end];
                    let _ = recipient.send(ok);
                }
                CacheMsg::PieceComplete { recipient, .. } => {
                    let _ = recipient.send(true);
                }
                CacheMsg::Prefetch { .. } => {}
            }
        }
    });

    tx
}

struct Engine {
    ctx: Arc<TorrentCtx>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    #[allow(dead_code)]
    manager_rx: mpsc::Receiver<ManagerMsg>,
    manager_ctx: Arc<ManagerCtx>,
}

/// Spin up one torrent engine without the listener, talking to an
/// in-memory cache.
fn spawn_engine(meta: TorrentMeta, cache_tx: mpsc::Sender<CacheMsg>) -> Engine {
    let (mtx, manager_rx) = mpsc::channel::<ManagerMsg>(32);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (stats_tx, mut stats_rx) = mpsc::unbounded_channel::<StatsMsg>();

    // drain stats so the sender never errors
    tokio::spawn(async move { while stats_rx.recv().await.is_some() {} });

    let manager_ctx = Arc::new(ManagerCtx {
        tx: mtx,
        local_peer_id: PeerId::gen(),
        global_peers: AtomicU32::new(0),
        blocklist: Arc::new(NoBlocklist),
        events_tx,
        dht_tx: None,
    });

    let mut torrent =
        Torrent::new(meta, manager_ctx.clone(), cache_tx, stats_tx);
    let ctx = torrent.ctx.clone();

    tokio::spawn(async move {
        let _ = torrent.run().await;
    });

    Engine { ctx, events_rx, manager_rx, manager_ctx }
}

/// Accept the engine's outbound dial and complete the wire handshake,
/// returning the message-framed socket.
async fn accept_and_handshake(
    listener: &TcpListener,
) -> Framed<TcpStream, CoreCodec> {
    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(socket, HandshakeCodec);

    let theirs = framed.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash.0, INFO_HASH);

    framed
        .send(Handshake::new(INFO_HASH, [9u8; 20]))
        .await
        .unwrap();

    let parts = framed.into_parts();
    let mut new_parts = FramedParts::new(parts.io, CoreCodec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    Framed::from_parts(new_parts)
}

/// A remote peer sending an oversized bitfield gets closed with a size
/// error; the torrent itself stays alive.
#[tokio::test(flavor = "multi_thread")]
async fn protocol_violation_closes_peer_but_not_torrent() {
    init_logs();

    let meta = meta(2);
    let expected = Arc::new(vec![1u8; 2 * BLOCK_LEN as usize]);
    let store = Arc::new(Mutex::new(vec![0u8; 2 * BLOCK_LEN as usize]));
    let cache_tx = spawn_cache(expected, store, meta.layout.unwrap());

    let mut engine = spawn_engine(meta, cache_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    engine
        .ctx
        .tx
        .send(TorrentMsg::AddPeers {
            peers: vec![(addr, Default::default())],
            source: AtomSource::Tracker,
        })
        .await
        .unwrap();

    // the engine dials us within a reconnect pulse or two
    let mut wire = timeout(Duration::from_secs(10), accept_and_handshake(&listener))
        .await
        .unwrap();

    // a 2-piece torrent has a 1-byte bitfield; send six bytes
    wire.send(Core::Bitfield(Bitfield::repeat(false, 48)))
        .await
        .unwrap();

    // the engine closes our connection
    let deadline = Duration::from_secs(10);
    let closed = timeout(deadline, async {
        loop {
            match wire.next().await {
                None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "peer was not disconnected");

    // ...but the torrent still answers queries
    let (otx, orx) = oneshot::channel();
    engine
        .ctx
        .tx
        .send(TorrentMsg::RequestMetadataPiece { piece: 0, recipient: otx })
        .await
        .unwrap();
    let served = orx.await.unwrap().unwrap();
    assert_eq!(served.0, 64);
    assert_eq!(served.1.len(), 64);

    // and no completion event ever fired
    assert!(engine.events_rx.try_recv().is_err());
}

/// Full download from a hand-rolled seed: handshake, HaveAll, unchoke,
/// requests, blocks, verification, completion event.
#[tokio::test(flavor = "multi_thread")]
async fn downloads_a_torrent_from_a_seed() {
    init_logs();

    let meta = meta(2);
    let the_layout = meta.layout.unwrap();

    let mut content = Vec::with_capacity(2 * BLOCK_LEN as usize);
    for i in 0..2 * BLOCK_LEN as usize {
        content.push((i % 251) as u8);
    }
    let expected = Arc::new(content.clone());
    let store = Arc::new(Mutex::new(vec![0u8; content.len()]));

    let cache_tx = spawn_cache(expected.clone(), store.clone(), the_layout);
    let mut engine = spawn_engine(meta, cache_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    engine
        .ctx
        .tx
        .send(TorrentMsg::AddPeers {
            peers: vec![(addr, Default::default())],
            source: AtomSource::Tracker,
        })
        .await
        .unwrap();

    // the seed side: serve every request with the right bytes
    let seed_content = content.clone();
    tokio::spawn(async move {
        let mut wire = accept_and_handshake(&listener).await;
        wire.send(Core::HaveAll).await.unwrap();
        wire.send(Core::Unchoke).await.unwrap();

        while let Some(Ok(msg)) = wire.next().await {
            if let Core::Request(info) = msg {
                let start = info.index as usize * BLOCK_LEN as usize
                    + info.begin as usize;
                let end = start + info.len as usize;
                let block = Block {
                    index: info.index as usize,
                    begin: info.begin,
                    block: Bytes::copy_from_slice(&seed_content[start..end]),
                };
                wire.send(Core::Piece(block)).await.unwrap();
            }
        }
    });

    // interest is declared on the 10 s rechoke tick, requests follow on
    // the next refill; leave generous slack
    let event = timeout(Duration::from_secs(60), engine.events_rx.recv())
        .await
        .expect("download did not finish in time")
        .expect("engine dropped its event channel");

    match event {
        EngineEvent::TorrentCompleted { info_hash } => {
            assert_eq!(info_hash.0, INFO_HASH);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    assert_eq!(*store.lock().unwrap(), content);
}

/// An inbound handshake names a torrent by info hash and gets routed to
/// it; the wire session then opens with the extended handshake and our
/// availability.
#[tokio::test(flavor = "multi_thread")]
async fn inbound_handshake_routes_by_info_hash() {
    init_logs();

    let meta = meta(2);
    let expected = Arc::new(vec![1u8; 2 * BLOCK_LEN as usize]);
    let store = Arc::new(Mutex::new(vec![0u8; 2 * BLOCK_LEN as usize]));
    let cache_tx = spawn_cache(expected, store, meta.layout.unwrap());

    let Engine { ctx, events_rx: _events_rx, mut manager_rx, manager_ctx } =
        spawn_engine(meta, cache_tx);

    // answer the registry lookups the way the manager would
    let torrent_ctx = ctx.clone();
    tokio::spawn(async move {
        while let Some(msg) = manager_rx.recv().await {
            if let ManagerMsg::GetTorrentCtx(info_hash, recipient) = msg {
                let ctx = (info_hash.0 == INFO_HASH)
                    .then(|| torrent_ctx.clone());
                let _ = recipient.send(ctx);
            }
        }
    });

    // the "listener": accept one socket and run the inbound side on it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager_ctx = manager_ctx.clone();
    tokio::spawn(async move {
        let (socket, peer_addr) = listener.accept().await.unwrap();
        let peer = Peer::new();
        let mut peer = peer
            .inbound_handshake(
                socket,
                manager_ctx.local_peer_id.clone(),
                manager_ctx,
            )
            .await
            .unwrap();
        let result = peer.run().await;
        let _ = peer
            .state
            .torrent_ctx
            .tx
            .send(TorrentMsg::PeerClosed {
                addr: peer_addr,
                graceful: result.is_ok(),
                read_anything: true,
            })
            .await;
    });

    // the remote leads with its handshake, as inbound peers do
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, HandshakeCodec);
    framed
        .send(Handshake::new(INFO_HASH, [8u8; 20]))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(10), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.info_hash.0, INFO_HASH);
    assert!(reply.supports_extended());
    assert!(reply.supports_fast());

    let parts = framed.into_parts();
    let mut new_parts = FramedParts::new(parts.io, CoreCodec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    let mut wire = Framed::from_parts(new_parts);

    // the engine opens with its extended handshake, then availability
    let first = timeout(Duration::from_secs(10), wire.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match first {
        Core::Extended(msg) => assert_eq!(msg.ext_id(), 0),
        other => panic!("expected the extended handshake, got {other:?}"),
    }

    let second = timeout(Duration::from_secs(10), wire.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second, Core::HaveNone);
}
