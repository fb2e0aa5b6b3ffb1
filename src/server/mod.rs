//! The session with the central server.
//!
//! One task owns the TCP link for the whole login session: it writes queued
//! requests in submission order, decodes pushes, and fans every push out to
//! the registered listeners in registration order. Request/response pairs
//! that the protocol answers asynchronously (peer addresses, user status)
//! are correlated by the subscribers themselves, so the session stays a
//! dumb pipe.
//!
//! A decode error on one message skips that message; a socket error ends
//! the session, which subscribers observe as their event stream closing.
//! Reconnecting is the host's decision.

pub mod codec;

pub use codec::{LoginResult, ServerEvent, ServerRequest, UserStatus};

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::event::{ListenerId, Listeners};
use crate::peer::codec::ConnectionType;
use codec::ServerCodec;

/// What the session task accepts from handles.
enum SessionCmd {
    Request(ServerRequest),
    Login {
        username: String,
        password: String,
        reply: oneshot::Sender<Result<LoginResult>>,
    },
    AddListener {
        reply: oneshot::Sender<(ListenerId, UnboundedReceiver<ServerEvent>)>,
    },
    RemoveListener(ListenerId),
    Shutdown,
}

/// A cheap, cloneable reference to the server session.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    cmd: UnboundedSender<SessionCmd>,
}

impl ServerHandle {
    fn request(&self, req: ServerRequest) -> Result<()> {
        self.cmd
            .send(SessionCmd::Request(req))
            .map_err(|_| Error::ServerDisconnected)
    }

    /// Performs the login exchange. A protocol level rejection comes back
    /// as [`LoginResult::Failure`], not as an error.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResult> {
        let (reply, response) = oneshot::channel();
        self.cmd
            .send(SessionCmd::Login {
                username: username.to_owned(),
                password: password.to_owned(),
                reply,
            })
            .map_err(|_| Error::ServerDisconnected)?;
        response.await.map_err(|_| Error::ServerDisconnected)?
    }

    /// Registers a listener for server pushes. Listeners fire in
    /// registration order; removal is explicit.
    pub async fn add_listener(&self) -> Result<(ListenerId, UnboundedReceiver<ServerEvent>)> {
        let (reply, response) = oneshot::channel();
        self.cmd
            .send(SessionCmd::AddListener { reply })
            .map_err(|_| Error::ServerDisconnected)?;
        response.await.map_err(|_| Error::ServerDisconnected)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let _ = self.cmd.send(SessionCmd::RemoveListener(id));
    }

    /// One keepalive ping. The session also pings on its own schedule.
    pub async fn ping(&self) -> Result<()> {
        self.request(ServerRequest::Ping)
    }

    pub async fn announce_listen(&self, port: u16, obfuscated_port: u16) -> Result<()> {
        self.request(ServerRequest::SetListenPort {
            port,
            obfuscated_port,
        })
    }

    pub async fn announce_shares(&self, folders: u32, files: u32) -> Result<()> {
        self.request(ServerRequest::SharedFoldersFiles { folders, files })
    }

    pub async fn set_status(&self, status: UserStatus) -> Result<()> {
        self.request(ServerRequest::SetOnlineStatus { status })
    }

    pub async fn search(&self, token: u32, query: &str) -> Result<()> {
        self.request(ServerRequest::FileSearch {
            token,
            query: query.to_owned(),
        })
    }

    pub async fn join_room(&self, room: &str) -> Result<()> {
        self.request(ServerRequest::JoinRoom {
            room: room.to_owned(),
        })
    }

    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.request(ServerRequest::LeaveRoom {
            room: room.to_owned(),
        })
    }

    pub async fn say(&self, room: &str, message: &str) -> Result<()> {
        self.request(ServerRequest::SayInChatRoom {
            room: room.to_owned(),
            message: message.to_owned(),
        })
    }

    pub async fn private_message(&self, username: &str, message: &str) -> Result<()> {
        self.request(ServerRequest::PrivateMessage {
            username: username.to_owned(),
            message: message.to_owned(),
        })
    }

    pub async fn ack_pm(&self, id: u32) -> Result<()> {
        self.request(ServerRequest::AckPrivateMessage { id })
    }

    pub async fn watch_user(&self, username: &str) -> Result<()> {
        self.request(ServerRequest::WatchUser {
            username: username.to_owned(),
        })
    }

    pub async fn unwatch_user(&self, username: &str) -> Result<()> {
        self.request(ServerRequest::UnwatchUser {
            username: username.to_owned(),
        })
    }

    pub async fn get_user_status(&self, username: &str) -> Result<()> {
        self.request(ServerRequest::GetUserStatus {
            username: username.to_owned(),
        })
    }

    pub async fn get_user_stats(&self, username: &str) -> Result<()> {
        self.request(ServerRequest::GetUserStats {
            username: username.to_owned(),
        })
    }

    /// Asks for a peer's address; the answer arrives as a
    /// [`ServerEvent::PeerAddress`] push.
    pub async fn get_peer_address(&self, username: &str) -> Result<()> {
        self.request(ServerRequest::GetPeerAddress {
            username: username.to_owned(),
        })
    }

    /// Asks the server to relay an indirect-connection invitation.
    pub async fn connect_to_peer(
        &self,
        token: u32,
        username: &str,
        connection_type: ConnectionType,
    ) -> Result<()> {
        self.request(ServerRequest::ConnectToPeer {
            token,
            username: username.to_owned(),
            connection_type,
        })
    }

    /// Tells the server a relayed offer is dead: we could not reach the
    /// peer directly and gave up.
    pub async fn cant_connect_to_peer(&self, token: u32, username: &str) -> Result<()> {
        self.request(ServerRequest::CantConnectToPeer {
            token,
            username: username.to_owned(),
        })
    }

    pub async fn have_no_parent(&self, no_parent: bool) -> Result<()> {
        self.request(ServerRequest::HaveNoParent(no_parent))
    }

    pub async fn room_list(&self) -> Result<()> {
        self.request(ServerRequest::RoomList)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd.send(SessionCmd::Shutdown);
    }

    /// A handle whose session discards everything; enough for components
    /// under test that only fire requests into the void.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (cmd, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { cmd }
    }
}

/// The task-owned session state.
pub(crate) struct ServerSession {
    socket: Framed<TcpStream, ServerCodec>,
    cmd_port: UnboundedReceiver<SessionCmd>,
    keepalive_interval: Duration,
}

impl ServerSession {
    /// Connects to the server. The session does nothing until
    /// [`run`](Self::run) is spawned.
    pub async fn connect(
        host: &str,
        port: u16,
        keepalive_interval: Duration,
    ) -> Result<(Self, ServerHandle)> {
        log::info!("Connecting to server {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        log::info!("Connected to server {}:{}", host, port);

        let (cmd, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                socket: Framed::new(stream, ServerCodec),
                cmd_port,
                keepalive_interval,
            },
            ServerHandle { cmd },
        ))
    }

    /// The session main loop. Returns when the socket dies or the handle
    /// asks for shutdown; listener streams close with it.
    pub async fn run(self) {
        let ServerSession {
            socket,
            cmd_port,
            keepalive_interval,
        } = self;

        let mut listeners: Listeners<ServerEvent> = Listeners::new();
        let mut pending_login: Option<oneshot::Sender<Result<LoginResult>>> = None;

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut cmd_port = cmd_port.fuse();
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_interval,
            keepalive_interval,
        )
        .fuse();

        loop {
            futures::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        log::debug!("Server push: code {}", event.code());
                        if let ServerEvent::Login(result) = &event {
                            if let Some(reply) = pending_login.take() {
                                let _ = reply.send(Ok(result.clone()));
                            }
                        }
                        listeners.dispatch(&event);
                    }
                    Some(Err(e)) => {
                        log::warn!("Server session failed: {}", e);
                        break;
                    }
                    None => {
                        log::info!("Server closed the connection");
                        break;
                    }
                },
                cmd = cmd_port.next() => match cmd {
                    Some(SessionCmd::Request(req)) => {
                        log::debug!("Server request: code {}", req.code());
                        if let Err(e) = sink.send(req).await {
                            log::warn!("Server write failed: {}", e);
                            break;
                        }
                    }
                    Some(SessionCmd::Login { username, password, reply }) => {
                        if pending_login.is_some() {
                            log::warn!("Login while another login is pending");
                        }
                        let req = ServerRequest::Login { username, password };
                        match sink.send(req).await {
                            Ok(()) => pending_login = Some(reply),
                            Err(e) => {
                                log::warn!("Server write failed: {}", e);
                                let _ = reply.send(Err(Error::ServerDisconnected));
                                break;
                            }
                        }
                    }
                    Some(SessionCmd::AddListener { reply }) => {
                        let _ = reply.send(listeners.add());
                    }
                    Some(SessionCmd::RemoveListener(id)) => {
                        listeners.remove(id);
                    }
                    Some(SessionCmd::Shutdown) | None => {
                        log::info!("Shutting down server session");
                        break;
                    }
                },
                _ = keepalive.next() => {
                    if let Err(e) = sink.send(ServerRequest::Ping).await {
                        log::warn!("Server keepalive failed: {}", e);
                        break;
                    }
                },
            }
        }

        if let Some(reply) = pending_login.take() {
            let _ = reply.send(Err(Error::ServerDisconnected));
        }
        // dropping the listeners closes every subscriber's stream, which is
        // how the rest of the engine observes the disconnect
    }
}
