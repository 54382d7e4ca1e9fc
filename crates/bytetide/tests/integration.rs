use std::{
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::Framed;

use bytetide::{
    command::{Command, Fetch},
    config::Config,
    error::Error,
    hash::HexHash,
    manifest::{Chunk, Manifest},
    merkle::MerkleTree,
    node::{Node, NodeCtx, NodeMsg},
    wire::{FrameCodec, Message, Request, Response, DATA_MAX},
};

const IDENT: &str = "integration-test-package-identifier";

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .without_time()
        .with_test_writer()
        .try_init();
}

fn scratch_dir() -> PathBuf {
    let name: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    let dir = std::env::temp_dir().join(format!("bytetide-it-{name}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Manifest of `data` cut in `chunk` sized pieces, with every expected hash
/// of the tree.
fn manifest_for(data: &[u8], chunk: usize, dir: &PathBuf) -> Manifest {
    let chunks: Vec<Chunk> = data
        .chunks(chunk)
        .enumerate()
        .map(|(i, bytes)| Chunk {
            hash: HexHash::digest(bytes),
            offset: (i * chunk) as u32,
            size: bytes.len() as u32,
        })
        .collect();

    let mut manifest = Manifest {
        ident: IDENT.into(),
        filename: "data.bin".into(),
        size: data.len() as u64,
        hashes: vec![],
        chunks,
    };

    let reference = dir.join("reference.bin");
    std::fs::write(&reference, data).unwrap();
    let tree = MerkleTree::build(&manifest, &reference).unwrap();
    manifest.hashes = tree
        .level_order()
        .into_iter()
        .filter_map(|i| tree.node(i).map(|n| n.computed))
        .collect();
    std::fs::remove_file(&reference).unwrap();

    manifest
}

async fn spawn_node(
    dir: &PathBuf,
    max_peers: usize,
) -> (Arc<NodeCtx>, JoinHandle<Result<(), Error>>) {
    let config = Config { directory: dir.clone(), max_peers, port: 0 };
    let node = Node::new(config).await.unwrap();
    let ctx = node.ctx.clone();
    (ctx, spawn(node.run()))
}

fn loopback(ctx: &NodeCtx) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], ctx.local_addr.port()))
}

/// Connect a raw socket and do the connecting side of the handshake.
async fn raw_peer(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut socket = Framed::new(socket, FrameCodec);
    assert_eq!(socket.next().await.unwrap().unwrap(), Message::Acp);
    socket.send(Message::Ack).await.unwrap();
    socket
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

async fn stop(ctx: Arc<NodeCtx>, handle: JoinHandle<Result<(), Error>>) {
    ctx.tx.send(NodeMsg::Quit).await.unwrap();
    handle.await.unwrap().unwrap();
}

// A REQ for 8192 bytes is answered with exactly 2 RES frames, at offsets
// 0 and 4092, carrying the file bytes.
#[tokio::test]
async fn request_is_streamed_in_frames() {
    init_logs();
    let dir = scratch_dir();
    let data = random_bytes(8192);
    let manifest = manifest_for(&data, 8192, &dir);
    std::fs::write(dir.join("data.bin"), &data).unwrap();

    let (ctx, handle) = spawn_node(&dir, 4).await;
    let package = ctx.add_package(manifest.clone()).await.unwrap();
    assert!(package.is_complete());

    let mut peer = raw_peer(loopback(&ctx)).await;

    peer.send(Message::Request(Request {
        offset: 0,
        size: 8192,
        hash: manifest.chunks[0].hash,
        ident: IDENT.into(),
    }))
    .await
    .unwrap();

    let mut received = vec![0u8; 8192];
    let mut offsets = vec![];

    for _ in 0..2 {
        match peer.next().await.unwrap().unwrap() {
            Message::Response(res) => {
                let start = res.offset as usize;
                received[start..start + res.data.len()]
                    .copy_from_slice(&res.data);
                offsets.push((res.offset, res.data.len()));
            }
            other => panic!("expected RES, got {other:?}"),
        }
    }

    assert_eq!(offsets, vec![(0, DATA_MAX), (4092, 8192 - DATA_MAX)]);
    assert_eq!(received, data);

    // a sub-range starting inside the chunk
    peer.send(Message::Request(Request {
        offset: 100,
        size: 50,
        hash: manifest.chunks[0].hash,
        ident: IDENT.into(),
    }))
    .await
    .unwrap();

    match peer.next().await.unwrap().unwrap() {
        Message::Response(res) => {
            assert_eq!(res.offset, 100);
            assert_eq!(res.data, data[100..150]);
        }
        other => panic!("expected RES, got {other:?}"),
    }

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn unknown_package_gets_one_error_response() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;

    let mut peer = raw_peer(loopback(&ctx)).await;

    peer.send(Message::Request(Request {
        offset: 0,
        size: 10,
        hash: HexHash::digest(b"nothing"),
        ident: "not managed".into(),
    }))
    .await
    .unwrap();

    assert!(matches!(
        peer.next().await.unwrap().unwrap(),
        Message::ResponseError(code) if code != 0
    ));

    // the connection is still usable
    peer.send(Message::Ping).await.unwrap();
    assert_eq!(peer.next().await.unwrap().unwrap(), Message::Pong);

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn control_frames() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;
    let peers = &ctx.peers;

    let mut peer = raw_peer(loopback(&ctx)).await;

    peer.send(Message::Unknown(0x42)).await.unwrap();
    peer.send(Message::Ack).await.unwrap();
    peer.send(Message::Pong).await.unwrap();
    peer.send(Message::Acp).await.unwrap();
    assert_eq!(peer.next().await.unwrap().unwrap(), Message::Acp);

    peer.send(Message::Ping).await.unwrap();
    assert_eq!(peer.next().await.unwrap().unwrap(), Message::Pong);

    // DSN makes the node forget about us
    assert_eq!(ctx.peers.len().await, 1);
    peer.send(Message::Dsn).await.unwrap();
    eventually(|| async move { peers.is_empty().await }).await;

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn closed_connection_leaves_registry() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;
    let peers = &ctx.peers;

    let peer = raw_peer(loopback(&ctx)).await;
    eventually(|| async move { peers.len().await == 1 }).await;

    drop(peer);
    eventually(|| async move { peers.is_empty().await }).await;

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn admission_stops_at_capacity() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 1).await;
    let peers = &ctx.peers;

    let mut first = raw_peer(loopback(&ctx)).await;
    eventually(|| async move { peers.len().await == 1 }).await;

    // handshake completes, then the node closes the socket
    let mut second = raw_peer(loopback(&ctx)).await;
    assert!(second.next().await.is_none());
    assert_eq!(ctx.peers.len().await, 1);

    first.send(Message::Ping).await.unwrap();
    assert_eq!(first.next().await.unwrap().unwrap(), Message::Pong);

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn quit_sends_dsn_to_peers() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;
    let peers = &ctx.peers;

    let mut peer = raw_peer(loopback(&ctx)).await;
    eventually(|| async move { peers.len().await == 1 }).await;

    stop(ctx, handle).await;

    assert_eq!(peer.next().await.unwrap().unwrap(), Message::Dsn);
    assert!(peer.next().await.is_none());

    std::fs::remove_dir_all(&dir).unwrap();
}

// Two nodes: the one missing the file fetches every chunk from the other
// and ends up with identical bytes.
#[tokio::test]
async fn fetch_fills_the_package() {
    init_logs();
    let seeder_dir = scratch_dir();
    let leecher_dir = scratch_dir();

    let data = random_bytes(3 * 5000 + 123);
    let manifest = manifest_for(&data, 5000, &seeder_dir);
    std::fs::write(seeder_dir.join("data.bin"), &data).unwrap();

    let (seeder, seeder_handle) = spawn_node(&seeder_dir, 4).await;
    let (leecher, leecher_handle) = spawn_node(&leecher_dir, 4).await;

    seeder.add_package(manifest.clone()).await.unwrap();
    let package = leecher.add_package(manifest.clone()).await.unwrap();
    assert!(!package.is_complete());
    assert_eq!(package.tree.missing_chunks(), vec![0, 1, 2, 3]);

    let seeder_addr = loopback(&seeder);
    let seeder_peers = &seeder.peers;

    // refused before connecting
    let out = leecher
        .execute(Command::Fetch(Fetch {
            addr: seeder_addr,
            ident: IDENT.into(),
            hash: None,
            offset: None,
            size: None,
        }))
        .await;
    assert_eq!(
        out.as_deref(),
        Some("Unable to request chunk, peer not in list")
    );

    let out = leecher.execute(Command::Connect(seeder_addr)).await;
    assert_eq!(out.as_deref(), Some("Connection established with peer"));
    let out = leecher.execute(Command::Connect(seeder_addr)).await;
    assert_eq!(out.as_deref(), Some("Already connected to peer"));
    eventually(|| async move { seeder_peers.len().await == 1 }).await;

    // one chunk by hash first
    let sent = leecher
        .fetch(&Fetch {
            addr: seeder_addr,
            ident: IDENT.into(),
            hash: Some(manifest.chunks[1].hash),
            offset: None,
            size: None,
        })
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let local = &leecher_dir.join("data.bin");
    let data = &data;
    eventually(|| async move {
        std::fs::read(local).unwrap()[5000..10000] == data[5000..10000]
    })
    .await;

    // then whatever is still missing
    let sent = leecher
        .fetch(&Fetch {
            addr: seeder_addr,
            ident: IDENT.into(),
            hash: None,
            offset: None,
            size: None,
        })
        .await
        .unwrap();
    assert_eq!(sent, 3);

    eventually(|| async move { std::fs::read(local).unwrap() == *data }).await;

    let report = leecher.execute(Command::Packages).await.unwrap();
    assert!(report.starts_with("1. "), "{report}");
    assert!(report.ends_with(" : COMPLETED"), "{report}");

    let peers = leecher.execute(Command::Peers).await.unwrap();
    assert_eq!(peers, format!("Connected to:\n\n1. {seeder_addr}"));

    let out = leecher.execute(Command::Disconnect(seeder_addr)).await;
    assert_eq!(out.as_deref(), Some("Disconnected from peer"));
    assert!(leecher.peers.is_empty().await);
    eventually(|| async move { seeder_peers.is_empty().await }).await;

    let out = leecher.execute(Command::Disconnect(seeder_addr)).await;
    assert_eq!(out.as_deref(), Some("Unknown peer, not connected"));

    let out = leecher.execute(Command::Peers).await;
    assert_eq!(out.as_deref(), Some("Not connected to any peers"));

    stop(seeder, seeder_handle).await;
    stop(leecher, leecher_handle).await;
    std::fs::remove_dir_all(&seeder_dir).unwrap();
    std::fs::remove_dir_all(&leecher_dir).unwrap();
}

#[tokio::test]
async fn connect_refuses_own_listener() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;

    let out = ctx.execute(Command::Connect(loopback(&ctx))).await;
    assert_eq!(out.as_deref(), Some("Unable to connect to request peer"));
    assert!(ctx.peers.is_empty().await);

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn package_commands() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;

    let out = ctx.execute(Command::Packages).await;
    assert_eq!(out.as_deref(), Some("No packages managed"));

    let out = ctx
        .execute(Command::AddPackage(dir.join("missing.bpkg")))
        .await;
    assert_eq!(out.as_deref(), Some("Cannot open file"));

    let bad = dir.join("bad.bpkg");
    std::fs::write(&bad, "ident:x\n").unwrap();
    let out = ctx.execute(Command::AddPackage(bad)).await;
    assert_eq!(out.as_deref(), Some("Unable to parse bpkg file"));

    let data = random_bytes(64);
    let manifest = manifest_for(&data, 16, &dir);
    let text = format!(
        "ident:{}\nfilename:{}\nsize:{}\nnhashes:{}\nhashes:\n{}\nnchunks:{}\nchunks:\n{}\n",
        manifest.ident,
        manifest.filename,
        manifest.size,
        manifest.hashes.len(),
        manifest
            .hashes
            .iter()
            .map(|h| format!("\t{h}"))
            .collect::<Vec<_>>()
            .join("\n"),
        manifest.chunks.len(),
        manifest
            .chunks
            .iter()
            .map(|c| format!("\t{},{},{}", c.hash, c.offset, c.size))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let good = dir.join("good.bpkg");
    std::fs::write(&good, text).unwrap();

    let out = ctx.execute(Command::AddPackage(good)).await;
    assert_eq!(out, None);
    // created zero-filled in the storage directory
    assert_eq!(std::fs::read(dir.join("data.bin")).unwrap(), vec![0u8; 64]);

    let out = ctx.execute(Command::Packages).await.unwrap();
    let ident: String = IDENT.chars().take(32).collect();
    assert_eq!(
        out,
        format!(
            "1. {ident}, {} : INCOMPLETE",
            dir.join("data.bin").display()
        )
    );

    std::fs::write(dir.join("data.bin"), &data).unwrap();
    let out = ctx.execute(Command::Packages).await.unwrap();
    assert!(out.ends_with(" : COMPLETED"), "{out}");

    let out = ctx
        .execute(Command::RemovePackage("integration-test-nope".into()))
        .await;
    assert_eq!(
        out.as_deref(),
        Some("Identifier provided does not match managed packages")
    );

    let out = ctx
        .execute(Command::RemovePackage(IDENT[..20].to_owned()))
        .await;
    assert_eq!(out.as_deref(), Some("Package has been removed"));

    let out = ctx.execute(Command::Packages).await;
    assert_eq!(out.as_deref(), Some("No packages managed"));

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

/// Send a REQ and collect every frame up to the PNG/POG marker sent right
/// after it.
async fn request_frames(
    peer: &mut Framed<TcpStream, FrameCodec>,
    req: Request,
) -> Vec<Message> {
    peer.send(Message::Request(req)).await.unwrap();
    peer.send(Message::Ping).await.unwrap();

    let mut frames = vec![];
    loop {
        match peer.next().await.unwrap().unwrap() {
            Message::Pong => return frames,
            msg => frames.push(msg),
        }
    }
}

#[tokio::test]
async fn unservable_requests() {
    init_logs();
    let dir = scratch_dir();
    let data = random_bytes(8192);
    let manifest = manifest_for(&data, 8192, &dir);
    std::fs::write(dir.join("data.bin"), &data).unwrap();

    let (ctx, handle) = spawn_node(&dir, 4).await;
    ctx.add_package(manifest.clone()).await.unwrap();

    let mut peer = raw_peer(loopback(&ctx)).await;
    let chunk = manifest.chunks[0].hash;

    // known package, hash that isn't one of its chunks
    let frames = request_frames(
        &mut peer,
        Request {
            offset: 0,
            size: 16,
            hash: HexHash::digest(b"not a chunk"),
            ident: IDENT.into(),
        },
    )
    .await;
    assert!(matches!(frames[..], [Message::ResponseError(_)]), "{frames:?}");

    // starts past the end of the file
    let frames = request_frames(
        &mut peer,
        Request { offset: 10_000, size: 16, hash: chunk, ident: IDENT.into() },
    )
    .await;
    assert!(matches!(frames[..], [Message::ResponseError(_)]), "{frames:?}");

    // runs past the end after some frames, the stream just stops short
    let frames = request_frames(
        &mut peer,
        Request { offset: 4092, size: 8192, hash: chunk, ident: IDENT.into() },
    )
    .await;
    let served: Vec<(u32, usize)> = frames
        .iter()
        .map(|msg| match msg {
            Message::Response(res) => (res.offset, res.data.len()),
            other => panic!("expected RES, got {other:?}"),
        })
        .collect();
    assert_eq!(served, vec![(4092, 4092), (8184, 8)]);

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn response_for_unmanaged_package_is_dropped() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;

    let mut peer = raw_peer(loopback(&ctx)).await;

    peer.send(Message::Response(Response {
        offset: 0,
        data: vec![1; 32],
        hash: HexHash::digest(b"whatever"),
        ident: "nobody manages this".into(),
    }))
    .await
    .unwrap();
    peer.send(Message::Ping).await.unwrap();

    // no reply to the RES, the PNG is the first thing answered
    assert_eq!(peer.next().await.unwrap().unwrap(), Message::Pong);
    assert_eq!(ctx.peers.len().await, 1);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

    stop(ctx, handle).await;
    std::fs::remove_dir_all(&dir).unwrap();
}

// Thousands of REQs in flight in both directions: neither handler may stop
// reading while its writes are pending, and the node keeps taking commands.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_fetch_does_not_stall() {
    init_logs();
    let seeder_dir = scratch_dir();
    let leecher_dir = scratch_dir();

    let data = random_bytes(5000 * 16);
    let manifest = manifest_for(&data, 16, &seeder_dir);
    std::fs::write(seeder_dir.join("data.bin"), &data).unwrap();

    let (seeder, seeder_handle) = spawn_node(&seeder_dir, 4).await;
    let (leecher, leecher_handle) = spawn_node(&leecher_dir, 4).await;

    seeder.add_package(manifest.clone()).await.unwrap();
    leecher.add_package(manifest.clone()).await.unwrap();

    let seeder_addr = loopback(&seeder);
    leecher.connect(seeder_addr).await.unwrap();

    // through the node loop, like a typed command
    let (tx, rx) = oneshot::channel();
    let fetch = Fetch {
        addr: seeder_addr,
        ident: IDENT.into(),
        hash: None,
        offset: None,
        size: None,
    };
    leecher
        .tx
        .send(NodeMsg::Command(Command::Fetch(fetch), tx))
        .await
        .unwrap();
    let out = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(out, None);

    // the loop answers while the transfer is running
    let (tx, rx) = oneshot::channel();
    leecher.tx.send(NodeMsg::Command(Command::Peers, tx)).await.unwrap();
    let out = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(out, Some(format!("Connected to:\n\n1. {seeder_addr}")));

    let local = &leecher_dir.join("data.bin");
    let data = &data;
    eventually(|| async move { std::fs::read(local).unwrap() == *data }).await;

    stop(seeder, seeder_handle).await;
    stop(leecher, leecher_handle).await;
    std::fs::remove_dir_all(&seeder_dir).unwrap();
    std::fs::remove_dir_all(&leecher_dir).unwrap();
}

// A remote that accepts the TCP connection but never greets keeps CONNECT
// waiting, cancelling the node must not wait for it.
#[tokio::test]
async fn cancel_interrupts_running_command() {
    init_logs();
    let dir = scratch_dir();
    let (ctx, handle) = spawn_node(&dir, 4).await;

    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let held = spawn(async move {
        let mut sockets = vec![];
        while let Ok((socket, _)) = silent.accept().await {
            sockets.push(socket);
        }
    });

    let (tx, rx) = oneshot::channel();
    ctx.tx
        .send(NodeMsg::Command(Command::Connect(silent_addr), tx))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    ctx.cancel.cancel();

    let result = timeout(Duration::from_secs(1), handle).await;
    assert!(result.is_ok(), "node did not stop while CONNECT was running");
    result.unwrap().unwrap().unwrap();

    // the command never completed
    assert!(rx.await.is_err());
    assert!(ctx.peers.is_empty().await);

    // connecting on a stopped node gives up right away
    let r = ctx.connect(silent_addr).await;
    assert!(matches!(r, Err(Error::Cancelled)), "{r:?}");

    held.abort();
    std::fs::remove_dir_all(&dir).unwrap();
}
