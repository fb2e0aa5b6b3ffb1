//! The engine: wiring between the listener socket, the server session, the
//! connection pool, the two transfer managers and the distributed node.
//!
//! [`Engine::start`] connects and logs in, announces our listen port and
//! share counts, and brings up the tasks. The returned [`EngineHandle`] is
//! the host's control surface; everything observable arrives on the event
//! stream handed back alongside it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::codec::Framed;

use crate::conf::Conf;
use crate::distributed::{DistributedNode, DistributedSearch};
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::peer::codec::{
    ConnectionType, Handshake, HandshakeCodec, PeerMessage, TransferDirection,
};
use crate::peer::{FileConnection, InboundMessage, PeerHandle};
use crate::pool::{IncomingFile, PeerConnectionPool, PoolHandle};
use crate::server::{LoginResult, ServerEvent, ServerHandle, ServerSession, UserStatus};
use crate::share::{to_directories, ShareManager};
use crate::upload::{UploadHandle, UploadManager, UploadMsg, UploadStats};
use crate::download::{DownloadHandle, DownloadManager, DownloadMsg};
use crate::TransferId;

/// How long an accepted connection gets to produce its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The stream of [`EngineEvent`]s handed to the host.
pub type EngineEvents = UnboundedReceiver<EngineEvent>;

/// The engine entry point.
pub struct Engine;

impl Engine {
    /// Connects to the server, logs in, and brings the full stack up.
    ///
    /// A rejected login comes back as [`Error::LoginRejected`] with the
    /// server's reason; the connection is dropped in that case.
    pub async fn start(
        conf: Conf,
        shares: Arc<dyn ShareManager>,
        username: &str,
        password: &str,
    ) -> Result<(EngineHandle, EngineEvents)> {
        let (session, server) = ServerSession::connect(
            &conf.engine.server_host,
            conf.engine.server_port,
            conf.engine.keepalive_interval,
        )
        .await?;
        tokio::spawn(session.run());

        let login = server.login(username, password).await?;
        match &login {
            LoginResult::Success { ip, .. } => {
                log::info!("Logged in as {} (our address {})", username, ip);
            }
            LoginResult::Failure { reason } => {
                server.shutdown();
                return Err(Error::LoginRejected(reason.clone()));
            }
        }

        // bind before announcing, and announce what actually got bound
        // (port 0 asks the OS to pick)
        let listener = TcpListener::bind(("0.0.0.0", conf.engine.listen_port)).await?;
        let listen_port = listener.local_addr()?.port();
        server.announce_listen(listen_port, 0).await?;
        let stats = shares.stats();
        server.announce_shares(stats.folders, stats.files).await?;
        server.set_status(UserStatus::Online).await?;
        server.have_no_parent(true).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(EngineEvent::LoggedIn(login));

        let (inbound_tx, inbound_rx) = mpsc::channel(crate::CHANNEL_CAPACITY);
        let (files_tx, files_rx) = mpsc::channel(crate::CHANNEL_CAPACITY);
        let (searches_tx, searches_rx) = mpsc::channel(crate::CHANNEL_CAPACITY);

        let (_pool_listener_id, pool_events) = server.add_listener().await?;
        let (_router_listener_id, router_events) = server.add_listener().await?;
        let (_distributed_listener_id, distributed_events) = server.add_listener().await?;

        let pool = PeerConnectionPool::spawn(
            conf.engine.clone(),
            username.to_owned(),
            server.clone(),
            pool_events,
            inbound_tx,
            files_tx,
            events_tx.clone(),
        );

        let ids = Arc::new(AtomicU64::new(1));
        let upload_stats = Arc::new(UploadStats::default());
        let upload = UploadManager::spawn(
            conf.transfer.clone(),
            conf.engine.clone(),
            username.to_owned(),
            shares.clone(),
            server.clone(),
            pool.clone(),
            events_tx.clone(),
            upload_stats.clone(),
            ids.clone(),
        );
        let download = DownloadManager::spawn(
            conf.transfer.clone(),
            pool.clone(),
            events_tx.clone(),
            ids,
        );

        let node = DistributedNode::new(username.to_owned(), server.clone(), searches_tx);
        tokio::spawn(node.run(distributed_events));

        let router = Router {
            our_username: username.to_owned(),
            shares,
            pool: pool.clone(),
            upload: upload.clone(),
            download: download.clone(),
            upload_stats,
            max_concurrent_uploads: conf.transfer.max_concurrent_uploads,
            events: events_tx,
        };
        tokio::spawn(router.run(inbound_rx, files_rx, searches_rx, router_events));

        tokio::spawn(accept_loop(listener, pool.clone(), download.clone()));

        Ok((
            EngineHandle {
                server,
                pool,
                upload,
                download,
            },
            events_rx,
        ))
    }
}

/// The host's control surface. Cloneable; all methods go through the
/// component tasks.
#[derive(Clone)]
pub struct EngineHandle {
    server: ServerHandle,
    pool: PoolHandle,
    upload: UploadHandle,
    download: DownloadHandle,
}

impl EngineHandle {
    /// Starts a network-wide search; results arrive as
    /// [`EngineEvent::SearchResults`] with the returned token.
    pub async fn search(&self, query: &str) -> Result<u32> {
        let token = rand::random();
        self.server.search(token, query).await?;
        Ok(token)
    }

    /// Asks `username` to queue `filename` for us; the transfer's fate
    /// arrives as [`EngineEvent::TransferUpdated`] snapshots.
    pub async fn download(
        &self,
        username: &str,
        filename: &str,
        size: u64,
        dest: Option<PathBuf>,
    ) -> Result<TransferId> {
        self.download.enqueue(username, filename, size, dest).await
    }

    /// Cancels a transfer in either direction.
    pub async fn cancel(&self, id: TransferId) -> Result<()> {
        self.upload.send(UploadMsg::Cancel { id }).await?;
        self.download.send(DownloadMsg::Cancel { id }).await
    }

    pub async fn set_status(&self, status: UserStatus) -> Result<()> {
        self.server.set_status(status).await
    }

    pub async fn join_room(&self, room: &str) -> Result<()> {
        self.server.join_room(room).await
    }

    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.server.leave_room(room).await
    }

    pub async fn say(&self, room: &str, message: &str) -> Result<()> {
        self.server.say(room, message).await
    }

    pub async fn private_message(&self, username: &str, message: &str) -> Result<()> {
        self.server.private_message(username, message).await
    }

    pub async fn ack_private_message(&self, id: u32) -> Result<()> {
        self.server.ack_pm(id).await
    }

    pub async fn watch_user(&self, username: &str) -> Result<()> {
        self.server.watch_user(username).await
    }

    pub async fn unwatch_user(&self, username: &str) -> Result<()> {
        self.server.unwatch_user(username).await
    }

    /// Answered asynchronously by a server push.
    pub async fn get_user_status(&self, username: &str) -> Result<()> {
        self.server.get_user_status(username).await
    }

    /// Answered asynchronously by a server push.
    pub async fn get_user_stats(&self, username: &str) -> Result<()> {
        self.server.get_user_stats(username).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.server.ping().await
    }

    pub async fn room_list(&self) -> Result<()> {
        self.server.room_list().await
    }

    /// Tears the engine down: the server session closes, which the other
    /// tasks observe through their closing event streams.
    pub fn shutdown(&self) {
        self.server.shutdown();
        self.pool.shutdown();
        let upload = self.upload.clone();
        let download = self.download.clone();
        tokio::spawn(async move {
            let _ = upload.send(UploadMsg::Shutdown).await;
            let _ = download.send(DownloadMsg::Shutdown).await;
        });
    }
}

/// Routes inbound traffic to whoever owns that part of the protocol.
struct Router {
    our_username: String,
    shares: Arc<dyn ShareManager>,
    pool: PoolHandle,
    upload: UploadHandle,
    download: DownloadHandle,
    upload_stats: Arc<UploadStats>,
    max_concurrent_uploads: usize,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Router {
    async fn run(
        self,
        inbound: mpsc::Receiver<InboundMessage>,
        files: mpsc::Receiver<IncomingFile>,
        searches: mpsc::Receiver<DistributedSearch>,
        server_events: UnboundedReceiver<ServerEvent>,
    ) {
        let mut inbound = inbound.fuse();
        let mut files = files.fuse();
        let mut searches = searches.fuse();
        let mut server_events = server_events.fuse();
        let mut server_alive = true;

        loop {
            futures::select! {
                msg = inbound.next() => match msg {
                    Some(msg) => self.route_peer_message(msg).await,
                    None => break,
                },
                file = files.next() => {
                    if let Some(file) = file {
                        let _ = self.download.send(DownloadMsg::File(file)).await;
                    }
                },
                search = searches.next() => {
                    if let Some(search) = search {
                        self.serve_search(search.username, search.token, search.query, None);
                    }
                },
                ev = server_events.next() => match ev {
                    Some(ev) => self.route_server_event(ev),
                    None => {
                        if server_alive {
                            server_alive = false;
                            log::warn!("Server session ended");
                            let _ = self.events.send(EngineEvent::ServerDisconnected);
                        }
                    }
                },
            }
        }
    }

    async fn route_peer_message(&self, msg: InboundMessage) {
        let InboundMessage {
            username,
            message,
            reply,
        } = msg;
        match message {
            message
            @
            (PeerMessage::QueueUpload { .. }
            | PeerMessage::TransferResponse { .. }
            | PeerMessage::PlaceInQueueRequest { .. }) => {
                let _ = self
                    .upload
                    .send(UploadMsg::Peer(InboundMessage {
                        username,
                        message,
                        reply,
                    }))
                    .await;
            }
            message
            @
            (PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                ..
            }
            | PeerMessage::PlaceInQueue { .. }
            | PeerMessage::UploadDenied { .. }
            | PeerMessage::UploadFailed { .. }) => {
                let _ = self
                    .download
                    .send(DownloadMsg::Peer(InboundMessage {
                        username,
                        message,
                        reply,
                    }))
                    .await;
            }
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token,
                ..
            } => {
                // the legacy pull request; downloads go through the queue
                let _ = reply.send(PeerMessage::TransferResponse {
                    token,
                    allowed: false,
                    reason: Some("Cancelled".to_owned()),
                });
            }
            PeerMessage::SharesRequest => {
                let directories = to_directories(self.shares.browse());
                let _ = reply.send(PeerMessage::SharesReply { directories });
            }
            PeerMessage::UserInfoRequest => {
                let _ = reply.send(PeerMessage::UserInfoReply {
                    description: String::new(),
                    picture: None,
                    total_uploads: self.upload_stats.active.load(Ordering::Acquire),
                    queue_size: self.upload_stats.queued.load(Ordering::Acquire),
                    slots_free: self.upload_stats.slot_free(self.max_concurrent_uploads),
                });
            }
            PeerMessage::FolderContentsRequest { token, folder } => {
                let groups = self
                    .shares
                    .browse()
                    .into_iter()
                    .filter(|(name, _)| name == &folder)
                    .collect();
                let _ = reply.send(PeerMessage::FolderContentsReply {
                    token,
                    folder,
                    directories: to_directories(groups),
                });
            }
            PeerMessage::SearchRequest { token, query } => {
                self.serve_search(username, token, query, Some(reply));
            }
            PeerMessage::SearchReply {
                username: from,
                token,
                files,
                slot_free,
                avg_speed,
                queue_length,
                ..
            } => {
                let _ = self.events.send(EngineEvent::SearchResults {
                    token,
                    username: from,
                    files,
                    slot_free,
                    avg_speed,
                    queue_length,
                });
            }
            other
            @
            (PeerMessage::SharesReply { .. }
            | PeerMessage::UserInfoReply { .. }
            | PeerMessage::FolderContentsReply { .. }) => {
                log::debug!("Unrequested {} reply from {}", other.code(), username);
            }
        }
    }

    fn route_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::FileSearch {
                username,
                token,
                query,
            } => {
                if username != self.our_username {
                    self.serve_search(username, token, query, None);
                }
            }
            ServerEvent::PrivateMessage {
                id,
                timestamp,
                username,
                message,
            } => {
                let _ = self.events.send(EngineEvent::PrivateMessage {
                    id,
                    timestamp,
                    username,
                    message,
                });
            }
            ServerEvent::SayInChatRoom {
                room,
                username,
                message,
            } => {
                let _ = self.events.send(EngineEvent::RoomMessage {
                    room,
                    username,
                    message,
                });
            }
            // the pool and the distributed node subscribe on their own
            _ => {}
        }
    }

    /// Answers a search from the share index. The reply goes over the P
    /// link the request came on when there is one, else over a fresh link
    /// to the searcher.
    fn serve_search(
        &self,
        searcher: String,
        token: u32,
        query: String,
        reply_on: Option<PeerHandle>,
    ) {
        let hits = self.shares.search(&query);
        if hits.is_empty() {
            return;
        }
        log::info!(
            "Serving search {:?} from {} with {} hits",
            query,
            searcher,
            hits.len()
        );
        let reply = PeerMessage::SearchReply {
            username: self.our_username.clone(),
            token,
            files: hits.iter().map(|f| f.to_entry()).collect(),
            slot_free: self.upload_stats.slot_free(self.max_concurrent_uploads),
            avg_speed: self.upload_stats.avg_speed.load(Ordering::Acquire) as u32,
            queue_length: self.upload_stats.queue_length(),
            private_files: Vec::new(),
        };

        if let Some(handle) = reply_on {
            let _ = handle.send(reply);
            return;
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            match pool.get_or_open_peer(&searcher).await {
                Ok(handle) => {
                    let _ = handle.send(reply);
                }
                Err(e) => {
                    log::debug!("Cannot deliver search reply to {}: {}", searcher, e);
                }
            }
        });
    }
}

/// Accepts incoming peer connections and dispatches them by their first
/// frame.
async fn accept_loop(mut listener: TcpListener, pool: PoolHandle, download: DownloadHandle) {
    log::info!("Accepting peer connections");
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                continue;
            }
        };
        log::debug!("Incoming connection from {}", addr);

        let pool = pool.clone();
        let download = download.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, HandshakeCodec);
            let handshake =
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
                    Ok(Some(Ok(handshake))) => handshake,
                    Ok(Some(Err(e))) => {
                        log::info!("Bad handshake from {}: {}", addr, e);
                        return;
                    }
                    Ok(None) | Err(_) => {
                        log::debug!("No handshake from {}", addr);
                        return;
                    }
                };
            let parts = framed.into_parts();

            match handshake {
                Handshake::PeerInit {
                    username,
                    connection_type: ConnectionType::Peer,
                    ..
                } => {
                    pool.incoming_peer(username, parts.io, parts.read_buf);
                }
                Handshake::PeerInit {
                    username,
                    connection_type: ConnectionType::File,
                    ..
                } => {
                    let _ = download
                        .send(DownloadMsg::File(IncomingFile {
                            username,
                            conn: FileConnection::new(parts.io, parts.read_buf),
                            pierce_token: None,
                        }))
                        .await;
                }
                Handshake::PeerInit {
                    username,
                    connection_type: ConnectionType::Distributed,
                    ..
                } => {
                    // leaf nodes take no children
                    log::debug!("Refusing distributed child {}", username);
                }
                Handshake::PierceFirewall { token } => {
                    pool.pierce_arrived(token, parts.io, parts.read_buf);
                }
            }
        });
    }
}
