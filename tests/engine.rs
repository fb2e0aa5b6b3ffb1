//! End to end tests: two engines talking through a scripted central server
//! on loopback, moving real bytes over real sockets.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use crateseek::conf::Conf;
use crateseek::engine::{Engine, EngineEvents};
use crateseek::event::EngineEvent;
use crateseek::peer::codec::{FileAttribute, PeerMessage, PeerMessageCodec};
use crateseek::server::{LoginResult, ServerEvent, ServerRequest};
use crateseek::share::{InMemoryShares, SharedFile};
use crateseek::transfer::{Transfer, TransferStatus};

/// Knobs that make the scripted server misbehave on purpose.
#[derive(Default)]
struct MockBehavior {
    /// Answer peer-address lookups for these users with a dead address.
    unreachable: Vec<String>,
    /// Answer every relayed connect-to-peer with a can't-connect push
    /// instead of forwarding it.
    reject_relays: bool,
}

struct Client {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    listen_port: u16,
}

#[derive(Default)]
struct MockState {
    clients: HashMap<String, Client>,
}

/// A minimal central server: logs clients in, resolves addresses from
/// their announced listen ports, relays connect-to-peer invitations and
/// fans searches out.
struct MockServer {
    addr: SocketAddr,
}

impl MockServer {
    async fn start(behavior: MockBehavior) -> MockServer {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let behavior = Arc::new(behavior);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let state = state.clone();
                let behavior = behavior.clone();
                tokio::spawn(serve_client(stream, state, behavior));
            }
        });

        MockServer { addr }
    }
}

async fn serve_client(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<MockState>>,
    behavior: Arc<MockBehavior>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut buf = BytesMut::new();
    let mut user = String::new();

    while let Some(frame) = read_frame(&mut reader, &mut buf).await {
        let request = match ServerRequest::decode(&frame) {
            Ok(request) => request,
            Err(_) => continue,
        };
        match request {
            ServerRequest::Login { username, .. } => {
                user = username.clone();
                state.lock().await.clients.insert(
                    username,
                    Client {
                        writer: writer.clone(),
                        listen_port: 0,
                    },
                );
                push(
                    &writer,
                    ServerEvent::Login(LoginResult::Success {
                        greeting: "Welcome".to_owned(),
                        ip: Ipv4Addr::new(127, 0, 0, 1),
                        password_md5: None,
                    }),
                )
                .await;
            }
            ServerRequest::SetListenPort { port, .. } => {
                if let Some(client) = state.lock().await.clients.get_mut(&user) {
                    client.listen_port = port;
                }
            }
            ServerRequest::GetPeerAddress { username } => {
                let port = if behavior.unreachable.contains(&username) {
                    // a port nothing listens on
                    1
                } else {
                    state
                        .lock()
                        .await
                        .clients
                        .get(&username)
                        .map(|c| c.listen_port)
                        .unwrap_or(0)
                };
                push(
                    &writer,
                    ServerEvent::PeerAddress {
                        username,
                        ip: Ipv4Addr::new(127, 0, 0, 1),
                        port,
                    },
                )
                .await;
            }
            ServerRequest::ConnectToPeer {
                token,
                username: target,
                connection_type,
            } => {
                if behavior.reject_relays {
                    push(&writer, ServerEvent::CantConnectToPeer { token }).await;
                    continue;
                }
                let state = state.lock().await;
                let requester_port = state
                    .clients
                    .get(&user)
                    .map(|c| c.listen_port)
                    .unwrap_or(0);
                if let Some(target) = state.clients.get(&target) {
                    push(
                        &target.writer,
                        ServerEvent::ConnectToPeer {
                            username: user.clone(),
                            connection_type,
                            ip: Ipv4Addr::new(127, 0, 0, 1),
                            port: requester_port,
                            token,
                            privileged: false,
                        },
                    )
                    .await;
                }
            }
            ServerRequest::FileSearch { token, query } => {
                let state = state.lock().await;
                for (name, client) in state.clients.iter() {
                    if *name != user {
                        push(
                            &client.writer,
                            ServerEvent::FileSearch {
                                username: user.clone(),
                                token,
                                query: query.clone(),
                            },
                        )
                        .await;
                    }
                }
            }
            _ => {}
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> Option<Vec<u8>> {
    loop {
        if buf.len() >= 4 {
            let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if buf.len() >= 4 + len {
                let frame = buf.split_to(4 + len);
                return Some(frame[4..].to_vec());
            }
        }
        let mut tmp = [0u8; 4096];
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

async fn push(writer: &Arc<Mutex<OwnedWriteHalf>>, event: ServerEvent) {
    let mut buf = BytesMut::new();
    event.encode(&mut buf);
    let _ = writer.lock().await.write_all(&buf).await;
}

/// Deterministic test payload.
fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "crateseek-e2e-{}-{}",
        tag,
        rand::random::<u32>()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn conf_for(server: &MockServer, download_dir: &PathBuf) -> Conf {
    let mut conf = Conf::new(0, download_dir);
    conf.engine.server_host = "127.0.0.1".to_owned();
    conf.engine.server_port = server.addr.port();
    conf
}

/// Starts an engine sharing `files`, logged in as `username`.
async fn start_engine(
    server: &MockServer,
    username: &str,
    files: Vec<SharedFile>,
    download_dir: &PathBuf,
) -> (crateseek::EngineHandle, EngineEvents) {
    let conf = conf_for(server, download_dir);
    let shares = Arc::new(InMemoryShares::new(files));
    Engine::start(conf, shares, username, "pw")
        .await
        .expect("engine start")
}

fn shared_file(shared_path: &str, local_path: PathBuf, size: u64) -> SharedFile {
    SharedFile {
        shared_path: shared_path.to_owned(),
        local_path,
        size,
        extension: "mp3".to_owned(),
        attributes: vec![FileAttribute {
            place: 0,
            value: 320,
        }],
    }
}

async fn wait_for_status(
    events: &mut EngineEvents,
    status: TransferStatus,
    secs: u64,
) -> Transfer {
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            match events.recv().await {
                Some(EngineEvent::TransferUpdated(transfer)) if transfer.status == status => {
                    return transfer;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} transfer within {}s", status, secs))
}

const FILE_SIZE: usize = 1_000_000;
const REMOTE_PATH: &str = "music\\song.mp3";

#[tokio::test(threaded_scheduler)]
async fn direct_transfer_completes() {
    let server = MockServer::start(MockBehavior::default()).await;

    let alice_dir = test_dir("alice-direct");
    let payload = content(FILE_SIZE);
    let source = alice_dir.join("song.mp3");
    std::fs::write(&source, &payload).unwrap();

    let (_alice, mut alice_events) = start_engine(
        &server,
        "alice",
        vec![shared_file(REMOTE_PATH, source, FILE_SIZE as u64)],
        &alice_dir,
    )
    .await;

    let bob_dir = test_dir("bob-direct");
    let (bob, mut bob_events) = start_engine(&server, "bob", vec![], &bob_dir).await;

    let dest = bob_dir.join("song.mp3");
    bob.download("alice", REMOTE_PATH, FILE_SIZE as u64, Some(dest.clone()))
        .await
        .expect("enqueue");

    let done = wait_for_status(&mut bob_events, TransferStatus::Completed, 60).await;
    assert_eq!(done.bytes_transferred, FILE_SIZE as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);

    // the uploader's record settled too
    let up = wait_for_status(&mut alice_events, TransferStatus::Completed, 60).await;
    assert_eq!(up.username, "bob");
}

#[tokio::test(threaded_scheduler)]
async fn indirect_transfer_pierces_the_firewall() {
    // the downloader's address resolves to a dead port, so the uploader's
    // dial fails and the relay path carries the day
    let server = MockServer::start(MockBehavior {
        unreachable: vec!["bob".to_owned()],
        ..MockBehavior::default()
    })
    .await;

    let alice_dir = test_dir("alice-indirect");
    let payload = content(FILE_SIZE);
    let source = alice_dir.join("song.mp3");
    std::fs::write(&source, &payload).unwrap();

    let (_alice, _alice_events) = start_engine(
        &server,
        "alice",
        vec![shared_file(REMOTE_PATH, source, FILE_SIZE as u64)],
        &alice_dir,
    )
    .await;

    let bob_dir = test_dir("bob-indirect");
    let (bob, mut bob_events) = start_engine(&server, "bob", vec![], &bob_dir).await;

    let dest = bob_dir.join("song.mp3");
    bob.download("alice", REMOTE_PATH, FILE_SIZE as u64, Some(dest.clone()))
        .await
        .expect("enqueue");

    let done = wait_for_status(&mut bob_events, TransferStatus::Completed, 60).await;
    assert_eq!(done.bytes_transferred, FILE_SIZE as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test(threaded_scheduler)]
async fn partial_download_resumes_at_the_offset() {
    let server = MockServer::start(MockBehavior::default()).await;

    let alice_dir = test_dir("alice-resume");
    let payload = content(FILE_SIZE);
    let source = alice_dir.join("song.mp3");
    std::fs::write(&source, &payload).unwrap();

    let (_alice, _alice_events) = start_engine(
        &server,
        "alice",
        vec![shared_file(REMOTE_PATH, source, FILE_SIZE as u64)],
        &alice_dir,
    )
    .await;

    let bob_dir = test_dir("bob-resume");
    let (bob, mut bob_events) = start_engine(&server, "bob", vec![], &bob_dir).await;

    // a partial file of zeros: if the uploader restarted from byte 0 the
    // head would match the payload, so surviving zeros prove the resume
    const PARTIAL: usize = 400_000;
    let dest = bob_dir.join("song.mp3");
    std::fs::write(&dest, vec![0u8; PARTIAL]).unwrap();

    bob.download("alice", REMOTE_PATH, FILE_SIZE as u64, Some(dest.clone()))
        .await
        .expect("enqueue");

    wait_for_status(&mut bob_events, TransferStatus::Completed, 60).await;

    let mut expected = vec![0u8; PARTIAL];
    expected.extend_from_slice(&payload[PARTIAL..]);
    let result = std::fs::read(&dest).unwrap();
    assert_eq!(result.len(), FILE_SIZE);
    assert_eq!(result, expected);
    assert_ne!(result, payload);
}

#[tokio::test(threaded_scheduler)]
async fn dead_relay_fails_the_upload_and_frees_the_slot() {
    // the downloader is unreachable and the server refuses to relay: the
    // upload must fail with the firewall reason rather than hang
    let server = MockServer::start(MockBehavior {
        unreachable: vec!["bob".to_owned()],
        reject_relays: true,
    })
    .await;

    let alice_dir = test_dir("alice-cantconnect");
    let payload = content(64 * 1024);
    let source = alice_dir.join("song.mp3");
    std::fs::write(&source, &payload).unwrap();

    let (_alice, mut alice_events) = start_engine(
        &server,
        "alice",
        vec![shared_file(REMOTE_PATH, source, payload.len() as u64)],
        &alice_dir,
    )
    .await;

    let bob_dir = test_dir("bob-cantconnect");
    let (bob, _bob_events) = start_engine(&server, "bob", vec![], &bob_dir).await;

    let dest = bob_dir.join("song.mp3");
    bob.download("alice", REMOTE_PATH, payload.len() as u64, Some(dest))
        .await
        .expect("enqueue");

    let failed = wait_for_status(&mut alice_events, TransferStatus::Failed, 60).await;
    assert_eq!(
        failed.error.as_deref(),
        Some("Peer unreachable (firewall)")
    );
}

// The receiver observes exactly the submitted sequence, whatever the
// byte-level interleaving underneath.
#[tokio::test]
async fn messages_arrive_in_send_order() {
    let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let receiver = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PeerMessageCodec::new());
        let mut seen = Vec::new();
        while seen.len() < 100 {
            match framed.next().await {
                Some(Ok(PeerMessage::PlaceInQueue { place, .. })) => seen.push(place),
                Some(Ok(_)) => {}
                other => panic!("stream ended early: {:?}", other),
            }
        }
        seen
    });

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, PeerMessageCodec::new());
    for place in 0..100u32 {
        framed
            .send(PeerMessage::PlaceInQueue {
                filename: "music\\song.mp3".to_owned(),
                place,
            })
            .await
            .unwrap();
    }
    framed.flush().await.unwrap();

    let seen = receiver.await.unwrap();
    assert_eq!(seen, (0..100).collect::<Vec<u32>>());
}

#[tokio::test(threaded_scheduler)]
async fn searches_come_back_with_results() {
    let server = MockServer::start(MockBehavior::default()).await;

    let alice_dir = test_dir("alice-search");
    let source = alice_dir.join("song.mp3");
    std::fs::write(&source, vec![1u8; 1024]).unwrap();

    let (_alice, _alice_events) = start_engine(
        &server,
        "alice",
        vec![shared_file("music\\aphex twin - song.mp3", source, 1024)],
        &alice_dir,
    )
    .await;

    let bob_dir = test_dir("bob-search");
    let (bob, mut bob_events) = start_engine(&server, "bob", vec![], &bob_dir).await;

    let token = bob.search("aphex twin").await.expect("search");

    let results = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match bob_events.recv().await {
                Some(EngineEvent::SearchResults {
                    token: got,
                    username,
                    files,
                    ..
                }) if got == token => return (username, files),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("no search results");

    assert_eq!(results.0, "alice");
    assert_eq!(results.1.len(), 1);
    assert_eq!(results.1[0].name, "music\\aphex twin - song.mp3");
}
