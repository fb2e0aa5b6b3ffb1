//! The peer connection pool.
//!
//! One task owns every map in here: the P-channel connections keyed by
//! username, the pending-token intents, the peer address cache and the
//! FIFO queues of address waiters. Everything else talks to it over its
//! command channel, so there is exactly one writer and no locks.
//!
//! Opening a connection is a little dance: resolve the address through the
//! server (cached for a short while), dial directly, and if the dial fails
//! fall back to asking the server to relay a connect-to-peer invitation and
//! waiting for the peer to pierce back with our token. Both the fallback
//! and file-channel piercing ride on the same token intent table.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use crate::conf::EngineConf;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::peer::codec::{ConnectionType, Handshake, HandshakeCodec};
use crate::peer::{
    Direction, FileConnection, InboundMessage, PeerConnection, PeerHandle,
};
use crate::server::{ServerEvent, ServerHandle};

/// How often dead entries and idle links are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the peer address cache.
const ADDRESS_CACHE_SIZE: usize = 512;

/// An F channel that arrived for the download side: an incoming `PeerInit`
/// on the listener, or our pierce after a relayed connect-to-peer. In the
/// pierced case the relay's token rides along, since the uploader starts
/// straight at the offset exchange.
pub(crate) struct IncomingFile {
    pub username: String,
    pub conn: FileConnection,
    pub pierce_token: Option<u32>,
}

/// What a live token is waiting for.
enum TokenIntent {
    /// An indirect P-channel open; the username the pierce will belong to.
    PeerChannel { username: String },
    /// A file channel pierce, delivered to whoever holds the receiver.
    FileChannel {
        reply: oneshot::Sender<Result<FileConnection>>,
    },
}

/// Commands the pool task accepts.
pub(crate) enum PoolCmd {
    /// Hand out the live P link for `username`, opening one if needed.
    GetOrOpenPeer {
        username: String,
        reply: oneshot::Sender<Result<PeerHandle>>,
    },
    /// Resolve a peer's listen address, through the cache or the server.
    ResolveAddress {
        username: String,
        reply: oneshot::Sender<Result<SocketAddr>>,
    },
    /// Mint a unique token wired to a file-channel pierce intent.
    MintFileToken {
        reply: oneshot::Sender<(u32, oneshot::Receiver<Result<FileConnection>>)>,
    },
    /// Register a peer-minted token so an inbound pierce can find its
    /// download. Rejected if the token is already live.
    RegisterForeignToken {
        token: u32,
        reply: oneshot::Sender<Result<oneshot::Receiver<Result<FileConnection>>>>,
    },
    /// Drop a pending intent; the token may be reused afterwards.
    ReleaseToken { token: u32 },
    /// An accepted connection finished its `PeerInit(user, P, _)` handshake.
    IncomingPeer {
        username: String,
        stream: TcpStream,
        leftover: BytesMut,
    },
    /// An accepted connection opened with `PierceFirewall(token)`.
    PierceArrived {
        token: u32,
        stream: TcpStream,
        leftover: BytesMut,
    },
    /// An opener task finished its direct dial.
    OpenedOutgoing {
        username: String,
        conn: PeerConnection,
        handle: PeerHandle,
    },
    /// An opener task failed its direct dial; the pool falls back to an
    /// indirect open.
    DirectDialFailed { username: String },
    /// The opener could not even resolve or the failure is final.
    OpenFailed { username: String, error: Error },
    /// A pierce intent outlived its deadline.
    IndirectTimeout { token: u32 },
    Shutdown,
}

/// A cheap, cloneable reference to the pool task.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    cmd: UnboundedSender<PoolCmd>,
}

impl PoolHandle {
    pub async fn get_or_open_peer(&self, username: &str) -> Result<PeerHandle> {
        let (reply, response) = oneshot::channel();
        self.cmd.send(PoolCmd::GetOrOpenPeer {
            username: username.to_owned(),
            reply,
        })?;
        response.await?
    }

    pub async fn resolve_address(&self, username: &str) -> Result<SocketAddr> {
        let (reply, response) = oneshot::channel();
        self.cmd.send(PoolCmd::ResolveAddress {
            username: username.to_owned(),
            reply,
        })?;
        response.await?
    }

    /// Mints a token whose pierce, should one arrive, is delivered on the
    /// returned receiver. Release it when the transfer settles.
    pub async fn mint_file_token(
        &self,
    ) -> Result<(u32, oneshot::Receiver<Result<FileConnection>>)> {
        let (reply, response) = oneshot::channel();
        self.cmd.send(PoolCmd::MintFileToken { reply })?;
        Ok(response.await?)
    }

    pub async fn register_foreign_token(
        &self,
        token: u32,
    ) -> Result<oneshot::Receiver<Result<FileConnection>>> {
        let (reply, response) = oneshot::channel();
        self.cmd
            .send(PoolCmd::RegisterForeignToken { token, reply })?;
        response.await?
    }

    pub fn release_token(&self, token: u32) {
        let _ = self.cmd.send(PoolCmd::ReleaseToken { token });
    }

    pub fn incoming_peer(&self, username: String, stream: TcpStream, leftover: BytesMut) {
        let _ = self.cmd.send(PoolCmd::IncomingPeer {
            username,
            stream,
            leftover,
        });
    }

    pub fn pierce_arrived(&self, token: u32, stream: TcpStream, leftover: BytesMut) {
        let _ = self.cmd.send(PoolCmd::PierceArrived {
            token,
            stream,
            leftover,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd.send(PoolCmd::Shutdown);
    }
}

/// The pool task state; single writer to all of it.
pub(crate) struct PeerConnectionPool {
    conf: EngineConf,
    our_username: String,
    server: ServerHandle,
    /// The one live P link per username.
    peers: HashMap<String, PeerHandle>,
    /// Live tokens and what their pierce should resolve.
    intents: HashMap<u32, TokenIntent>,
    /// Callers waiting for a P link that is being opened.
    opening: HashMap<String, Vec<oneshot::Sender<Result<PeerHandle>>>>,
    /// Fresh-enough peer addresses.
    address_cache: LruCache<String, (SocketAddr, Instant)>,
    /// FIFO queues of address waiters, one queue per username.
    address_waiters: HashMap<String, VecDeque<oneshot::Sender<Result<SocketAddr>>>>,
    cmd: UnboundedSender<PoolCmd>,
    /// Inbound P messages are forwarded here for routing.
    inbound: mpsc::Sender<InboundMessage>,
    /// F channels destined for the download side.
    incoming_files: mpsc::Sender<IncomingFile>,
    events: UnboundedSender<EngineEvent>,
    /// Connection tasks report their death here.
    drop_tx: UnboundedSender<(String, ConnectionType)>,
}

impl PeerConnectionPool {
    /// Spawns the pool task. `server_events` must be a listener registered
    /// on the server session.
    pub fn spawn(
        conf: EngineConf,
        our_username: String,
        server: ServerHandle,
        server_events: UnboundedReceiver<ServerEvent>,
        inbound: mpsc::Sender<InboundMessage>,
        incoming_files: mpsc::Sender<IncomingFile>,
        events: UnboundedSender<EngineEvent>,
    ) -> PoolHandle {
        let (cmd, cmd_port) = mpsc::unbounded_channel();
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let pool = Self {
            conf,
            our_username,
            server,
            peers: HashMap::new(),
            intents: HashMap::new(),
            opening: HashMap::new(),
            address_cache: LruCache::new(ADDRESS_CACHE_SIZE),
            address_waiters: HashMap::new(),
            cmd: cmd.clone(),
            inbound,
            incoming_files,
            events,
            drop_tx,
        };
        tokio::spawn(pool.run(cmd_port, server_events, drop_rx));
        PoolHandle { cmd }
    }

    async fn run(
        mut self,
        cmd_port: UnboundedReceiver<PoolCmd>,
        server_events: UnboundedReceiver<ServerEvent>,
        drop_rx: UnboundedReceiver<(String, ConnectionType)>,
    ) {
        let mut cmd_port = cmd_port.fuse();
        let mut server_events = server_events.fuse();
        let mut drop_rx = drop_rx.fuse();
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + SWEEP_INTERVAL,
            SWEEP_INTERVAL,
        )
        .fuse();

        loop {
            futures::select! {
                cmd = cmd_port.next() => match cmd {
                    Some(PoolCmd::Shutdown) | None => break,
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
                ev = server_events.next() => match ev {
                    Some(ev) => self.handle_server_event(ev).await,
                    None => self.server_lost(),
                },
                death = drop_rx.next() => {
                    if let Some((username, channel)) = death {
                        self.reap(&username, channel);
                    }
                },
                _ = sweep.next() => self.sweep(),
            }
        }

        log::info!("Shutting down connection pool");
        for (_, handle) in self.peers.drain() {
            handle.close();
        }
    }

    async fn handle_cmd(&mut self, cmd: PoolCmd) {
        match cmd {
            PoolCmd::GetOrOpenPeer { username, reply } => {
                self.get_or_open(username, reply);
            }
            PoolCmd::ResolveAddress { username, reply } => {
                self.resolve_address(username, reply).await;
            }
            PoolCmd::MintFileToken { reply } => {
                let (token, rx) = self.mint_file_intent();
                let _ = reply.send((token, rx));
            }
            PoolCmd::RegisterForeignToken { token, reply } => {
                if self.intents.contains_key(&token) {
                    log::warn!("Rejecting duplicate live token {}", token);
                    let _ = reply.send(Err(Error::Protocol("duplicate live token")));
                } else {
                    let (tx, rx) = oneshot::channel();
                    self.intents
                        .insert(token, TokenIntent::FileChannel { reply: tx });
                    let _ = reply.send(Ok(rx));
                }
            }
            PoolCmd::ReleaseToken { token } => {
                self.intents.remove(&token);
            }
            PoolCmd::IncomingPeer {
                username,
                stream,
                leftover,
            } => {
                self.register_incoming_peer(username, stream, leftover);
            }
            PoolCmd::PierceArrived {
                token,
                stream,
                leftover,
            } => {
                self.pierce_arrived(token, stream, leftover);
            }
            PoolCmd::OpenedOutgoing {
                username,
                conn,
                handle,
            } => {
                self.install(username, conn, handle);
            }
            PoolCmd::DirectDialFailed { username } => {
                self.start_indirect_open(username).await;
            }
            PoolCmd::OpenFailed { username, error } => {
                self.fail_opening(&username, error);
            }
            PoolCmd::IndirectTimeout { token } => {
                self.indirect_timeout(token).await;
            }
            PoolCmd::Shutdown => unreachable!("handled in run"),
        }
    }

    /// Handles the server pushes the pool subscribes to. Several other
    /// subsystems listen to the same events through their own registered
    /// listeners; dispatch order is registration order.
    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::PeerAddress { username, ip, port } => {
                if port == 0 {
                    // the server answers port 0 for unknown or offline users
                    if let Some(waiter) = self.pop_address_waiter(&username) {
                        let _ = waiter.send(Err(Error::PeerUnreachable));
                    }
                    return;
                }
                let addr = SocketAddr::from((ip, port));
                self.address_cache
                    .put(username.clone(), (addr, Instant::now()));
                if let Some(waiter) = self.pop_address_waiter(&username) {
                    let _ = waiter.send(Ok(addr));
                }
            }
            ServerEvent::ConnectToPeer {
                username,
                connection_type,
                ip,
                port,
                token,
                ..
            } => {
                self.connect_back(username, connection_type, SocketAddr::from((ip, port)), token);
            }
            ServerEvent::CantConnectToPeer { token } => {
                match self.intents.remove(&token) {
                    Some(TokenIntent::FileChannel { reply }) => {
                        let _ = reply.send(Err(Error::PeerUnreachable));
                    }
                    Some(TokenIntent::PeerChannel { username }) => {
                        self.fail_opening(&username, Error::PeerUnreachable);
                    }
                    None => {}
                }
            }
            _ => {}
        }
    }

    /// The server link died: every pending resolution and intent that
    /// depended on it fails now. Existing connections keep running.
    fn server_lost(&mut self) {
        log::warn!("Server session lost; failing pending pool work");
        for (_, mut queue) in self.address_waiters.drain() {
            while let Some(waiter) = queue.pop_front() {
                let _ = waiter.send(Err(Error::ServerDisconnected));
            }
        }
        for (_, intent) in self.intents.drain() {
            if let TokenIntent::FileChannel { reply } = intent {
                let _ = reply.send(Err(Error::ServerDisconnected));
            }
        }
        let usernames: Vec<String> = self.opening.keys().cloned().collect();
        for username in usernames {
            self.fail_opening(&username, Error::ServerDisconnected);
        }
    }

    fn get_or_open(&mut self, username: String, reply: oneshot::Sender<Result<PeerHandle>>) {
        if let Some(handle) = self.peers.get(&username) {
            if handle.is_live() {
                let _ = reply.send(Ok(handle.clone()));
                return;
            }
            self.remove_peer(&username);
        }

        let already_opening = self.opening.contains_key(&username);
        self.opening.entry(username.clone()).or_default().push(reply);
        if already_opening {
            return;
        }

        // opener task: resolve, dial, report back; the indirect fallback is
        // driven from the pool so the intent table stays single-writer
        let cmd = self.cmd.clone();
        let pool = PoolHandle { cmd: cmd.clone() };
        let our_username = self.our_username.clone();
        let dial_timeout = self.conf.dial_timeout;
        tokio::spawn(async move {
            let addr = match pool.resolve_address(&username).await {
                Ok(addr) => addr,
                Err(error) => {
                    let _ = cmd.send(PoolCmd::OpenFailed { username, error });
                    return;
                }
            };
            match PeerConnection::connect_direct(
                addr,
                &our_username,
                username.clone(),
                ConnectionType::Peer,
                0,
                dial_timeout,
            )
            .await
            {
                Ok((conn, handle)) => {
                    let _ = cmd.send(PoolCmd::OpenedOutgoing {
                        username,
                        conn,
                        handle,
                    });
                }
                Err(e) => {
                    log::info!("Direct dial to {} failed: {}", username, e);
                    let _ = cmd.send(PoolCmd::DirectDialFailed { username });
                }
            }
        });
    }

    async fn resolve_address(
        &mut self,
        username: String,
        reply: oneshot::Sender<Result<SocketAddr>>,
    ) {
        if let Some((addr, at)) = self.address_cache.get(&username) {
            if at.elapsed() < self.conf.address_cache_ttl {
                let _ = reply.send(Ok(*addr));
                return;
            }
        }
        // one server request per waiter; replies pop the queue front
        self.address_waiters
            .entry(username.clone())
            .or_default()
            .push_back(reply);
        if self.server.get_peer_address(&username).await.is_err() {
            if let Some(waiter) = self.pop_address_waiter(&username) {
                let _ = waiter.send(Err(Error::ServerDisconnected));
            }
        }
    }

    fn pop_address_waiter(&mut self, username: &str) -> Option<oneshot::Sender<Result<SocketAddr>>> {
        let queue = self.address_waiters.get_mut(username)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.address_waiters.remove(username);
        }
        waiter
    }

    /// Mints a token no live intent is using.
    fn mint_file_intent(&mut self) -> (u32, oneshot::Receiver<Result<FileConnection>>) {
        let mut token = rand::random::<u32>();
        while self.intents.contains_key(&token) {
            token = rand::random::<u32>();
        }
        let (tx, rx) = oneshot::channel();
        self.intents
            .insert(token, TokenIntent::FileChannel { reply: tx });
        (token, rx)
    }

    async fn start_indirect_open(&mut self, username: String) {
        if !self.opening.contains_key(&username) {
            // everyone gave up while the dial was failing
            return;
        }
        let mut token = rand::random::<u32>();
        while self.intents.contains_key(&token) {
            token = rand::random::<u32>();
        }
        self.intents.insert(
            token,
            TokenIntent::PeerChannel {
                username: username.clone(),
            },
        );
        if self
            .server
            .connect_to_peer(token, &username, ConnectionType::Peer)
            .await
            .is_err()
        {
            self.intents.remove(&token);
            self.fail_opening(&username, Error::ServerDisconnected);
            return;
        }
        log::info!(
            "Waiting for {} to pierce back with token {}",
            username,
            token
        );
        let cmd = self.cmd.clone();
        let wait = self.conf.indirect_timeout;
        tokio::spawn(async move {
            tokio::time::delay_for(wait).await;
            let _ = cmd.send(PoolCmd::IndirectTimeout { token });
        });
    }

    async fn indirect_timeout(&mut self, token: u32) {
        match self.intents.remove(&token) {
            Some(TokenIntent::PeerChannel { username }) => {
                log::info!("Pierce wait for {} timed out", username);
                let _ = self.server.cant_connect_to_peer(token, &username).await;
                self.fail_opening(&username, Error::PeerUnreachable);
            }
            // file intents run their own deadlines in the managers
            Some(intent) => {
                self.intents.insert(token, intent);
            }
            None => {}
        }
    }

    fn fail_opening(&mut self, username: &str, error: Error) {
        if let Some(waiters) = self.opening.remove(username) {
            for waiter in waiters {
                let _ = waiter.send(Err(error.replicate()));
            }
        }
    }

    /// Installs a connected P link, spawns its task and satisfies waiters.
    fn install(&mut self, username: String, conn: PeerConnection, handle: PeerHandle) {
        // invariant: one live P link per user; the newcomer loses unless
        // the incumbent is already terminal
        if let Some(existing) = self.peers.get(&username) {
            if existing.is_live() {
                log::info!("Duplicate P link for {}, dropping the newer one", username);
                handle.close();
                // the duplicate's task still drains waiters through the
                // incumbent
                let incumbent = existing.clone();
                if let Some(waiters) = self.opening.remove(&username) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(incumbent.clone()));
                    }
                }
                tokio::spawn(conn.run(
                    self.inbound.clone(),
                    handle,
                    self.drop_tx.clone(),
                ));
                return;
            }
            self.remove_peer(&username);
        }

        let direction = handle.direction;
        self.peers.insert(username.clone(), handle.clone());
        tokio::spawn(conn.run(self.inbound.clone(), handle.clone(), self.drop_tx.clone()));
        let _ = self.events.send(EngineEvent::PeerConnected {
            username: username.clone(),
            channel: ConnectionType::Peer,
            direction,
        });
        if let Some(waiters) = self.opening.remove(&username) {
            for waiter in waiters {
                let _ = waiter.send(Ok(handle.clone()));
            }
        }
    }

    fn register_incoming_peer(&mut self, username: String, stream: TcpStream, leftover: BytesMut) {
        let (conn, handle) = PeerConnection::establish(
            stream,
            leftover,
            username.clone(),
            ConnectionType::Peer,
            Direction::Incoming,
        );
        self.install(username, conn, handle);
    }

    /// A `PierceFirewall(token)` arrived on the listener; route the socket
    /// to whatever the token was minted for.
    fn pierce_arrived(&mut self, token: u32, stream: TcpStream, leftover: BytesMut) {
        match self.intents.remove(&token) {
            Some(TokenIntent::FileChannel { reply }) => {
                if reply
                    .send(Ok(FileConnection::new(stream, leftover)))
                    .is_err()
                {
                    log::debug!("Pierce {} arrived after its transfer settled", token);
                }
            }
            Some(TokenIntent::PeerChannel { username }) => {
                log::info!("Peer {} pierced back with token {}", username, token);
                let (conn, handle) = PeerConnection::establish(
                    stream,
                    leftover,
                    username.clone(),
                    ConnectionType::Peer,
                    Direction::Incoming,
                );
                self.install(username, conn, handle);
            }
            None => {
                log::info!("Pierce with unknown token {}, dropping", token);
            }
        }
    }

    /// The server relayed a peer's connect-to-peer invitation: we open the
    /// connection from our side and pierce with their token.
    fn connect_back(
        &mut self,
        username: String,
        connection_type: ConnectionType,
        addr: SocketAddr,
        token: u32,
    ) {
        log::info!(
            "Connect-to-peer from {} ({} channel, token {})",
            username,
            connection_type,
            token
        );
        let cmd = self.cmd.clone();
        let incoming_files = self.incoming_files.clone();
        let dial_timeout = self.conf.dial_timeout;
        tokio::spawn(async move {
            let stream =
                match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        log::info!("Connect-back to {} failed: {}", username, e);
                        return;
                    }
                    Err(_) => {
                        log::info!("Connect-back to {} timed out", username);
                        return;
                    }
                };

            let mut handshake = Framed::new(stream, HandshakeCodec);
            if let Err(e) = handshake.send(Handshake::PierceFirewall { token }).await {
                log::info!("Pierce to {} failed: {}", username, e);
                return;
            }
            let parts = handshake.into_parts();

            match connection_type {
                ConnectionType::Peer => {
                    let _ = cmd.send(PoolCmd::IncomingPeer {
                        username,
                        stream: parts.io,
                        leftover: parts.read_buf,
                    });
                }
                ConnectionType::File => {
                    let mut incoming_files = incoming_files;
                    let _ = incoming_files
                        .send(IncomingFile {
                            username,
                            conn: FileConnection::new(parts.io, parts.read_buf),
                            pierce_token: Some(token),
                        })
                        .await;
                }
                ConnectionType::Distributed => {
                    // leaf nodes take no children
                    log::debug!("Ignoring distributed connect-back from {}", username);
                }
            }
        });
    }

    /// A connection task died; forget the map entry if it is really the
    /// dead one (it may have been replaced already).
    fn reap(&mut self, username: &str, channel: ConnectionType) {
        if channel != ConnectionType::Peer {
            return;
        }
        let gone = match self.peers.get(username) {
            Some(handle) => !handle.is_live(),
            None => false,
        };
        if gone {
            self.remove_peer(username);
        }
    }

    fn remove_peer(&mut self, username: &str) {
        if self.peers.remove(username).is_some() {
            let _ = self.events.send(EngineEvent::PeerDisconnected {
                username: username.to_owned(),
                channel: ConnectionType::Peer,
            });
        }
    }

    /// Closes idle, unpinned links and forgets dead entries.
    fn sweep(&mut self) {
        let idle_timeout = self.conf.peer_idle_timeout;
        let mut dead = Vec::new();
        for (username, handle) in &self.peers {
            if !handle.is_live() {
                log::debug!("Reaping {} link in state {:?}", username, handle.state());
                dead.push(username.clone());
            } else if handle.idle_for() > idle_timeout && !handle.is_pinned() {
                log::info!(
                    "Evicting idle peer link {} ({} B in, {} B out, {} B/s)",
                    username,
                    handle.bytes_in(),
                    handle.bytes_out(),
                    handle.speed(),
                );
                handle.close();
            }
        }
        for username in dead {
            self.remove_peer(&username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn spawn_pool() -> PoolHandle {
        let server = ServerHandle::detached();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_server_events_tx, server_events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = mpsc::channel(64);
        let (files_tx, _files_rx) = mpsc::channel(64);
        PeerConnectionPool::spawn(
            crate::conf::EngineConf::new(0),
            "me".to_owned(),
            server,
            server_events_rx,
            inbound_tx,
            files_tx,
            events_tx,
        )
    }

    #[tokio::test]
    async fn minted_tokens_are_unique_while_live() {
        let pool = spawn_pool();
        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..100 {
            let (token, rx) = pool.mint_file_token().await.unwrap();
            assert!(seen.insert(token), "token {} minted twice", token);
            receivers.push(rx);
        }
    }

    #[tokio::test]
    async fn duplicate_foreign_token_is_rejected() {
        let pool = spawn_pool();
        let (token, _rx) = pool.mint_file_token().await.unwrap();

        // the same token cannot be registered again while live
        assert!(pool.register_foreign_token(token).await.is_err());

        // released tokens are free for reuse
        pool.release_token(token);
        tokio::time::delay_for(std::time::Duration::from_millis(50)).await;
        assert!(pool.register_foreign_token(token).await.is_ok());
    }
}
