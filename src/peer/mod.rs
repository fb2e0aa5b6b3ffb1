//! A single peer link and its two personas.
//!
//! P and D channels carry framed, typed messages for the whole life of the
//! link. F channels are framed only for the opening handshake and then turn
//! into a raw byte stream, so they get their own [`FileConnection`] type
//! that the transfer code drives directly.
//!
//! Each framed connection is owned by exactly one task running
//! [`PeerConnection::run`]; everyone else talks to it through a cloneable
//! [`PeerHandle`]. Inbound messages are forwarded in arrival order, outbound
//! messages are written in submission order.

pub mod codec;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Framed, FramedParts};

use crate::counter::ThruputCounter;
use crate::error::{Error, Result};
use codec::{ConnectionType, Handshake, HandshakeCodec, PeerMessage, PeerMessageCodec};

/// How long a closing connection gets to drain its final bytes.
pub(crate) const CLOSE_DRAIN: Duration = Duration::from_millis(500);

/// Who opened the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle of a peer link. The two terminal states are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            _ => ConnectionState::Failed,
        }
    }
}

/// State shared between a connection's owning task and onlookers (the pool
/// for eviction, the managers for pinning).
pub(crate) struct ConnectionShared {
    state: AtomicU8,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Snapshot of the rolling average, bytes per second.
    speed: AtomicU64,
    /// Milliseconds since `epoch` of the last traffic.
    last_activity_ms: AtomicU64,
    /// Transfers currently relying on this link; pinned links are never
    /// evicted.
    pins: AtomicU32,
    epoch: Instant,
    counter: Mutex<ThruputCounter>,
}

impl ConnectionShared {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            pins: AtomicU32::new(0),
            epoch: Instant::now(),
            counter: Mutex::new(ThruputCounter::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Terminal states win over any late transition.
    pub fn set_state(&self, new: ConnectionState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current).is_terminal() {
                return;
            }
            match self.state.compare_exchange(
                current,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        self.epoch
            .elapsed()
            .checked_sub(Duration::from_millis(last))
            .unwrap_or_default()
    }

    pub fn record_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::AcqRel);
        self.touch();
        let mut counter = self.counter.lock().unwrap();
        counter.record(bytes);
        self.speed.store(counter.avg(), Ordering::Release);
    }

    pub fn record_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::AcqRel);
        self.touch();
        let mut counter = self.counter.lock().unwrap();
        counter.record(bytes);
        self.speed.store(counter.avg(), Ordering::Release);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Acquire)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Commands a connection's owning task accepts from handles.
pub(crate) enum PeerCommand {
    Send(PeerMessage),
    Close,
}

/// A message that arrived on some P link, tagged for routing.
pub(crate) struct InboundMessage {
    pub username: String,
    pub message: PeerMessage,
    /// The link it arrived on, for replies.
    pub reply: PeerHandle,
}

/// A cheap, cloneable reference to a framed peer link.
#[derive(Clone)]
pub(crate) struct PeerHandle {
    pub username: String,
    pub channel: ConnectionType,
    pub direction: Direction,
    cmd: UnboundedSender<PeerCommand>,
    shared: Arc<ConnectionShared>,
}

impl PeerHandle {
    /// Queues a message for writing. Submission order is write order.
    pub fn send(&self, msg: PeerMessage) -> Result<()> {
        self.cmd
            .send(PeerCommand::Send(msg))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Asks the owning task to flush, drain and tear down.
    pub fn close(&self) {
        let _ = self.cmd.send(PeerCommand::Close);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_live(&self) -> bool {
        !self.shared.state().is_terminal()
    }

    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    pub fn speed(&self) -> u64 {
        self.shared.speed()
    }

    pub fn bytes_in(&self) -> u64 {
        self.shared.bytes_in()
    }

    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out()
    }

    /// Marks the link as carrying an active transfer, shielding it from
    /// idle eviction. Balanced by [`unpin`](Self::unpin).
    pub fn pin(&self) {
        self.shared.pin();
    }

    pub fn unpin(&self) {
        self.shared.unpin();
    }

    pub fn is_pinned(&self) -> bool {
        self.shared.is_pinned()
    }
}

#[cfg(test)]
impl PeerHandle {
    /// A connected-looking handle wired to nothing but an inspectable
    /// command stream.
    pub(crate) fn detached(username: &str) -> (Self, UnboundedReceiver<PeerCommand>) {
        let (cmd, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared::new(ConnectionState::Connected));
        shared.touch();
        (
            Self {
                username: username.to_owned(),
                channel: ConnectionType::Peer,
                direction: Direction::Incoming,
                cmd,
                shared,
            },
            rx,
        )
    }
}

/// The task-owned side of a framed P or D link.
pub(crate) struct PeerConnection {
    pub username: String,
    pub channel: ConnectionType,
    pub direction: Direction,
    pub addr: SocketAddr,
    socket: Framed<TcpStream, PeerMessageCodec>,
    shared: Arc<ConnectionShared>,
    cmd_port: UnboundedReceiver<PeerCommand>,
}

impl PeerConnection {
    /// Wraps an already handshaken stream. `leftover` carries any bytes the
    /// handshake codec had buffered past the first frame.
    pub fn establish(
        stream: TcpStream,
        leftover: BytesMut,
        username: String,
        channel: ConnectionType,
        direction: Direction,
    ) -> (Self, PeerHandle) {
        let addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let shared = Arc::new(ConnectionShared::new(ConnectionState::Connected));
        shared.touch();

        let mut parts = FramedParts::new(stream, PeerMessageCodec::with_counters(shared.clone()));
        parts.read_buf = leftover;
        let socket = Framed::from_parts(parts);

        let (cmd, cmd_port) = mpsc::unbounded_channel();
        let handle = PeerHandle {
            username: username.clone(),
            channel,
            direction,
            cmd,
            shared: shared.clone(),
        };
        (
            Self {
                username,
                channel,
                direction,
                addr,
                socket,
                shared,
                cmd_port,
            },
            handle,
        )
    }

    /// Dials a peer directly and opens the link with
    /// `PeerInit(our_username, channel, token)`.
    pub async fn connect_direct(
        addr: SocketAddr,
        our_username: &str,
        username: String,
        channel: ConnectionType,
        token: u32,
        dial_timeout: Duration,
    ) -> Result<(Self, PeerHandle)> {
        log::info!("Connecting to peer {} at {}", username, addr);
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("peer dial"))??;

        let mut handshake = Framed::new(stream, HandshakeCodec);
        handshake
            .send(Handshake::PeerInit {
                username: our_username.to_owned(),
                connection_type: channel,
                token,
            })
            .await?;

        let parts = handshake.into_parts();
        Ok(Self::establish(
            parts.io,
            parts.read_buf,
            username,
            channel,
            Direction::Outgoing,
        ))
    }

    /// The link's main loop: forwards inbound messages in arrival order and
    /// writes queued sends in submission order, until either side closes.
    ///
    /// On exit the terminal state is already recorded and `dropped` is told
    /// which link died.
    pub async fn run(
        self,
        inbound: mpsc::Sender<InboundMessage>,
        handle: PeerHandle,
        dropped: UnboundedSender<(String, ConnectionType)>,
    ) {
        let PeerConnection {
            username,
            channel,
            addr,
            socket,
            shared,
            cmd_port,
            ..
        } = self;
        log::debug!("Peer {} {} link at {} running", username, channel, addr);

        // split so that reads and writes can live in separate select arms
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut cmd_port = cmd_port.fuse();
        let mut inbound = inbound;

        loop {
            futures::select! {
                msg = stream.next() => match msg {
                    Some(Ok(message)) => {
                        let forwarded = inbound
                            .send(InboundMessage {
                                username: username.clone(),
                                message,
                                reply: handle.clone(),
                            })
                            .await;
                        if forwarded.is_err() {
                            // router is gone, we are shutting down
                            shared.set_state(ConnectionState::Disconnected);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::info!("Peer {} {} link failed: {}", username, channel, e);
                        shared.set_state(ConnectionState::Failed);
                        break;
                    }
                    None => {
                        log::debug!("Peer {} {} link closed by remote", username, channel);
                        shared.set_state(ConnectionState::Disconnected);
                        break;
                    }
                },
                cmd = cmd_port.next() => match cmd {
                    Some(PeerCommand::Send(msg)) => {
                        if let Err(e) = sink.send(msg).await {
                            log::info!("Peer {} {} write failed: {}", username, channel, e);
                            shared.set_state(ConnectionState::Failed);
                            break;
                        }
                    }
                    Some(PeerCommand::Close) | None => {
                        let _ = sink.flush().await;
                        tokio::time::delay_for(CLOSE_DRAIN).await;
                        shared.set_state(ConnectionState::Disconnected);
                        break;
                    }
                },
            }
        }

        let _ = dropped.send((username, channel));
    }
}

/// The raw-byte persona of an F channel, past its handshake.
pub(crate) struct FileConnection {
    stream: TcpStream,
    /// Bytes the handshake codec read past the first frame; they are served
    /// before the socket is touched again.
    read_buf: BytesMut,
}

impl FileConnection {
    pub fn new(stream: TcpStream, read_buf: BytesMut) -> Self {
        Self { stream, read_buf }
    }

    /// Dials the peer and opens a file channel with
    /// `PeerInit(our_username, "F", 0)`.
    pub async fn connect_direct(
        addr: SocketAddr,
        our_username: &str,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("file channel dial"))??;

        let mut handshake = Framed::new(stream, HandshakeCodec);
        handshake
            .send(Handshake::PeerInit {
                username: our_username.to_owned(),
                connection_type: ConnectionType::File,
                token: 0,
            })
            .await?;

        let parts = handshake.into_parts();
        Ok(Self::new(parts.io, parts.read_buf))
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn send_u32_le(&mut self, v: u32) -> Result<()> {
        self.send_raw(&v.to_le_bytes()).await
    }

    pub async fn send_u64_le(&mut self, v: u64) -> Result<()> {
        self.send_raw(&v.to_le_bytes()).await
    }

    /// Reads exactly `n` bytes, draining the handshake leftover first.
    pub async fn receive_raw_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        let from_buf = self.read_buf.len().min(n);
        if from_buf > 0 {
            out[..from_buf].copy_from_slice(&self.read_buf.split_to(from_buf));
            filled = from_buf;
        }
        if filled < n {
            tokio::time::timeout(timeout, self.stream.read_exact(&mut out[filled..]))
                .await
                .map_err(|_| Error::Timeout("file channel read"))??;
        }
        Ok(out)
    }

    pub async fn receive_u32_le(&mut self, timeout: Duration) -> Result<u32> {
        let raw = self.receive_raw_exact(4, timeout).await?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub async fn receive_u64_le(&mut self, timeout: Duration) -> Result<u64> {
        let raw = self.receive_raw_exact(8, timeout).await?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reads whatever is available into `buf`, leftover first. `Ok(0)`
    /// means the peer closed.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.read_buf.split_to(n));
            return Ok(n);
        }
        Ok(self.stream.read(buf).await?)
    }

    /// Flushes, gives TCP a moment to drain, and tears down.
    pub async fn close(mut self) {
        let _ = self.stream.flush().await;
        tokio::time::delay_for(CLOSE_DRAIN).await;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
