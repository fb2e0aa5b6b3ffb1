//! The upload manager: queue admission, the offer protocol and the actual
//! file streaming.
//!
//! One task owns the queue and the pending and active maps; every input,
//! peer messages, timeouts and progress from streaming tasks alike, arrives
//! through its inbox, so the state machine runs without locks. A pending
//! offer holds an upload slot just like an active stream does, which is
//! what keeps `pending + active` under the configured cap.
//!
//! The life of one upload: a peer's `QueueUpload` is admitted to the queue;
//! when a slot frees up we mint a token, send `TransferRequest` and wait
//! for `TransferResponse`; on acceptance a streaming task opens the file
//! channel (telling the server about the token first, so the peer can
//! pierce back if our dial loses the race), reads the peer's resume offset
//! and pushes 64 KiB chunks until done.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{pin_mut, FutureExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::conf::{EngineConf, TransferConf};
use crate::counter::ThruputCounter;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::peer::codec::{ConnectionType, PeerMessage, TransferDirection};
use crate::peer::{FileConnection, InboundMessage, PeerHandle};
use crate::pool::PoolHandle;
use crate::server::ServerHandle;
use crate::share::ShareManager;
use crate::transfer::Transfer;
use crate::TransferId;

/// Streaming chunk size.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Reason sent and recorded when neither dial nor pierce worked.
pub(crate) const UNREACHABLE_REASON: &str = "Peer unreachable (firewall)";

/// Reason sent when a user exceeds their queue allowance.
const TOO_MANY_QUEUED: &str = "Too many files queued";

/// Reason sent when the requested path is not shared (or unreadable).
const NOT_SHARED: &str = "File not shared.";

/// Live counts shared with the search-serving side, which reports slot
/// availability and queue depth in replies.
#[derive(Default)]
pub(crate) struct UploadStats {
    pub active: AtomicU32,
    pub queued: AtomicU32,
    pub avg_speed: AtomicU64,
}

impl UploadStats {
    pub fn slot_free(&self, max_concurrent: usize) -> bool {
        (self.active.load(Ordering::Acquire) as usize) < max_concurrent
    }

    pub fn queue_length(&self) -> u64 {
        u64::from(self.queued.load(Ordering::Acquire))
    }
}

/// An admitted request waiting for a free slot. FIFO overall, which also
/// makes it FIFO per user.
struct QueuedUpload {
    id: TransferId,
    username: String,
    filename: String,
    local_path: PathBuf,
    size: u64,
    /// The P link the request arrived on, used for the offer and the queue
    /// position updates.
    offer_connection: PeerHandle,
    #[allow(dead_code)]
    queued_at: Instant,
}

/// An offer in flight: `TransferRequest` sent, response not yet in.
struct PendingUpload {
    id: TransferId,
    username: String,
    filename: String,
    local_path: PathBuf,
    size: u64,
    token: u32,
    offer_connection: PeerHandle,
    /// Delivers the peer's pierce if our later dial loses the race.
    pierce: Option<oneshot::Receiver<Result<FileConnection>>>,
}

/// An accepted upload whose streaming task is running.
struct ActiveUpload {
    username: String,
    filename: String,
    token: u32,
    offer_connection: PeerHandle,
    cancelled: Arc<AtomicBool>,
}

/// What the manager task accepts.
pub(crate) enum UploadMsg {
    /// A routed P-channel message: `QueueUpload`, `TransferResponse` or
    /// `PlaceInQueueRequest`.
    Peer(InboundMessage),
    /// The 60 s offer response deadline fired.
    OfferTimeout { token: u32 },
    /// A streaming task read its resume offset and started pushing bytes.
    Started { id: TransferId, offset: u64 },
    /// Periodic progress from a streaming task.
    Progress {
        id: TransferId,
        bytes_transferred: u64,
        speed: u64,
    },
    /// A streaming task settled.
    Finished { id: TransferId, result: Result<()> },
    /// Host asked to cancel.
    Cancel { id: TransferId },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct UploadHandle {
    tx: mpsc::Sender<UploadMsg>,
}

impl UploadHandle {
    pub async fn send(&self, msg: UploadMsg) -> Result<()> {
        self.tx.clone().send(msg).await.map_err(Error::from)
    }
}

pub(crate) struct UploadManager {
    conf: TransferConf,
    net_conf: EngineConf,
    our_username: String,
    shares: Arc<dyn ShareManager>,
    server: ServerHandle,
    pool: PoolHandle,
    events: mpsc::UnboundedSender<EngineEvent>,
    stats: Arc<UploadStats>,

    queue: VecDeque<QueuedUpload>,
    pending: HashMap<u32, PendingUpload>,
    active: HashMap<TransferId, ActiveUpload>,
    transfers: HashMap<TransferId, Transfer>,

    /// Transfer ids come from one allocator shared with the download side,
    /// so a host-facing id never means two things.
    ids: Arc<AtomicU64>,
    inbox: mpsc::Sender<UploadMsg>,
}

impl UploadManager {
    /// Spawns the manager task.
    pub fn spawn(
        conf: TransferConf,
        net_conf: EngineConf,
        our_username: String,
        shares: Arc<dyn ShareManager>,
        server: ServerHandle,
        pool: PoolHandle,
        events: mpsc::UnboundedSender<EngineEvent>,
        stats: Arc<UploadStats>,
        ids: Arc<AtomicU64>,
    ) -> UploadHandle {
        let (tx, rx) = mpsc::channel(crate::CHANNEL_CAPACITY);
        let manager = Self {
            conf,
            net_conf,
            our_username,
            shares,
            server,
            pool,
            events,
            stats,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            active: HashMap::new(),
            transfers: HashMap::new(),
            ids,
            inbox: tx.clone(),
        };
        tokio::spawn(manager.run(rx));
        UploadHandle { tx }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<UploadMsg>) {
        while let Some(msg) = inbox.recv().await {
            match msg {
                UploadMsg::Peer(inbound) => self.handle_peer_message(inbound).await,
                UploadMsg::OfferTimeout { token } => self.offer_timeout(token).await,
                UploadMsg::Started { id, offset } => self.transfer_started(id, offset),
                UploadMsg::Progress {
                    id,
                    bytes_transferred,
                    speed,
                } => self.transfer_progress(id, bytes_transferred, speed),
                UploadMsg::Finished { id, result } => self.transfer_finished(id, result).await,
                UploadMsg::Cancel { id } => self.cancel(id).await,
                UploadMsg::Shutdown => break,
            }
        }
        log::info!("Shutting down upload manager");
        for (_, active) in self.active.drain() {
            active.cancelled.store(true, Ordering::Release);
        }
    }

    async fn handle_peer_message(&mut self, inbound: InboundMessage) {
        let InboundMessage {
            username,
            message,
            reply,
        } = inbound;
        match message {
            PeerMessage::QueueUpload { filename } => {
                self.admit(username, filename, reply).await;
            }
            PeerMessage::TransferResponse {
                token,
                allowed,
                reason,
            } => {
                self.offer_answered(token, allowed, reason).await;
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                if let Some(place) = self.queue_position(&username, &filename) {
                    let _ = reply.send(PeerMessage::PlaceInQueue { filename, place });
                }
            }
            other => {
                log::debug!(
                    "Upload manager ignoring {} message from {}",
                    other.code(),
                    username
                );
            }
        }
    }

    /// Queue admission. A denial never mints a token.
    async fn admit(&mut self, username: String, filename: String, reply: PeerHandle) {
        // duplicate: answer with the current position instead of re-queueing
        if let Some(place) = self.queue_position(&username, &filename) {
            let _ = reply.send(PeerMessage::PlaceInQueue { filename, place });
            return;
        }
        if self.is_in_flight(&username, &filename) {
            log::debug!("{} re-requested in-flight {}", username, filename);
            return;
        }

        let shared = match self.shares.lookup(&filename) {
            Some(shared) => shared,
            None => {
                log::info!("{} asked for unshared {}", username, filename);
                let _ = reply.send(PeerMessage::UploadDenied {
                    filename,
                    reason: NOT_SHARED.to_owned(),
                });
                return;
            }
        };
        if tokio::fs::metadata(&shared.local_path).await.is_err() {
            log::warn!("Shared file missing on disk: {:?}", shared.local_path);
            let _ = reply.send(PeerMessage::UploadDenied {
                filename,
                reason: NOT_SHARED.to_owned(),
            });
            return;
        }

        if self.user_load(&username) >= self.conf.max_queued_per_user {
            log::info!("{} exceeded the per-user queue allowance", username);
            let _ = reply.send(PeerMessage::UploadDenied {
                filename,
                reason: TOO_MANY_QUEUED.to_owned(),
            });
            return;
        }

        let id = self.ids.fetch_add(1, Ordering::AcqRel);
        let transfer = Transfer::new(
            id,
            username.clone(),
            filename.clone(),
            shared.size,
            TransferDirection::Upload,
        );
        self.transfers.insert(id, transfer);
        self.queue.push_back(QueuedUpload {
            id,
            username,
            filename: filename.clone(),
            local_path: shared.local_path,
            size: shared.size,
            offer_connection: reply.clone(),
            queued_at: Instant::now(),
        });
        let place = self.queue.len() as u32;
        let _ = reply.send(PeerMessage::PlaceInQueue { filename, place });
        self.sync_stats();
        self.emit(id);
        self.pump().await;
    }

    /// Counts a user's stake in the queue and in flight, for the per-user
    /// allowance.
    fn user_load(&self, username: &str) -> usize {
        self.queue.iter().filter(|q| q.username == username).count()
            + self
                .pending
                .values()
                .filter(|p| p.username == username)
                .count()
            + self
                .active
                .values()
                .filter(|a| a.username == username)
                .count()
    }

    fn is_in_flight(&self, username: &str, filename: &str) -> bool {
        self.pending
            .values()
            .any(|p| p.username == username && p.filename == filename)
            || self
                .active
                .values()
                .any(|a| a.username == username && a.filename == filename)
    }

    fn queue_position(&self, username: &str, filename: &str) -> Option<u32> {
        self.queue
            .iter()
            .position(|q| q.username == username && q.filename == filename)
            .map(|pos| pos as u32 + 1)
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    /// Fills free slots from the queue front: mint a token, send the offer,
    /// arm the response deadline.
    async fn pump(&mut self) {
        while self.in_flight() < self.conf.max_concurrent_uploads {
            let queued = match self.queue.pop_front() {
                Some(queued) => queued,
                None => break,
            };

            // a dead offer link means the peer is gone; try a fresh one
            let offer_connection = if queued.offer_connection.is_live() {
                queued.offer_connection.clone()
            } else {
                match self.pool.get_or_open_peer(&queued.username).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        log::info!(
                            "Cannot reach {} for queued upload: {}",
                            queued.username,
                            e
                        );
                        self.fail(queued.id, e.transfer_reason());
                        continue;
                    }
                }
            };

            let (token, pierce) = match self.pool.mint_file_token().await {
                Ok(minted) => minted,
                Err(e) => {
                    self.fail(queued.id, e.transfer_reason());
                    continue;
                }
            };

            let offer = PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                filename: queued.filename.clone(),
                file_size: Some(queued.size),
            };
            if offer_connection.send(offer).is_err() {
                self.pool.release_token(token);
                self.fail(queued.id, UNREACHABLE_REASON);
                continue;
            }
            log::info!(
                "Offered {} to {} with token {}",
                queued.filename,
                queued.username,
                token
            );

            if let Some(transfer) = self.transfers.get_mut(&queued.id) {
                transfer.mark_connecting();
            }
            self.emit(queued.id);

            self.pending.insert(
                token,
                PendingUpload {
                    id: queued.id,
                    username: queued.username,
                    filename: queued.filename,
                    local_path: queued.local_path,
                    size: queued.size,
                    token,
                    offer_connection,
                    pierce: Some(pierce),
                },
            );

            let mut inbox = self.inbox.clone();
            let offer_timeout = self.conf.offer_timeout;
            tokio::spawn(async move {
                tokio::time::delay_for(offer_timeout).await;
                let _ = inbox.send(UploadMsg::OfferTimeout { token }).await;
            });
        }
        self.sync_stats();
        self.broadcast_places();
    }

    /// Every queued peer learns its new 1-based position.
    fn broadcast_places(&self) {
        for (pos, queued) in self.queue.iter().enumerate() {
            let _ = queued.offer_connection.send(PeerMessage::PlaceInQueue {
                filename: queued.filename.clone(),
                place: pos as u32 + 1,
            });
        }
    }

    async fn offer_answered(&mut self, token: u32, allowed: bool, reason: Option<String>) {
        let mut pending = match self.pending.remove(&token) {
            Some(pending) => pending,
            None => {
                log::debug!("Response for unknown offer token {}", token);
                return;
            }
        };

        if !allowed {
            let reason = reason.unwrap_or_else(|| "Transfer rejected".to_owned());
            log::info!(
                "{} rejected {} ({})",
                pending.username,
                pending.filename,
                reason
            );
            self.pool.release_token(token);
            self.fail(pending.id, reason);
            self.pump().await;
            return;
        }

        log::info!("{} accepted token {}", pending.username, token);
        if let Some(transfer) = self.transfers.get_mut(&pending.id) {
            transfer.mark_transferring();
        }
        self.emit(pending.id);

        let cancelled = Arc::new(AtomicBool::new(false));
        let pierce = match pending.pierce.take() {
            Some(pierce) => pierce,
            None => {
                // cannot happen: the receiver is only taken here
                log::error!("Offer {} lost its pierce receiver", token);
                self.pool.release_token(token);
                self.fail(pending.id, "internal error");
                return;
            }
        };
        self.active.insert(
            pending.id,
            ActiveUpload {
                username: pending.username.clone(),
                filename: pending.filename.clone(),
                token,
                offer_connection: pending.offer_connection.clone(),
                cancelled: cancelled.clone(),
            },
        );
        self.sync_stats();

        pending.offer_connection.pin();
        let task = StreamTask {
            id: pending.id,
            username: pending.username,
            local_path: pending.local_path,
            size: pending.size,
            token,
            our_username: self.our_username.clone(),
            server: self.server.clone(),
            pool: self.pool.clone(),
            inbox: self.inbox.clone(),
            dial_timeout: self.net_conf.dial_timeout,
            indirect_timeout: self.net_conf.indirect_timeout,
            speed_cap: self.conf.upload_speed_cap_bps,
            cancelled,
        };
        tokio::spawn(task.run(pierce));
    }

    async fn offer_timeout(&mut self, token: u32) {
        if let Some(pending) = self.pending.remove(&token) {
            log::info!(
                "Offer to {} for {} timed out",
                pending.username,
                pending.filename
            );
            self.pool.release_token(token);
            self.fail(pending.id, "Transfer offer timed out");
            self.pump().await;
        }
    }

    fn transfer_started(&mut self, id: TransferId, offset: u64) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.bytes_transferred = offset;
            transfer.mark_transferring();
        }
        self.emit(id);
    }

    fn transfer_progress(&mut self, id: TransferId, bytes_transferred: u64, speed: u64) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.bytes_transferred = bytes_transferred;
            transfer.speed = speed;
        }
        self.stats.avg_speed.store(speed, Ordering::Release);
        let _ = self.events.send(EngineEvent::TransferProgress {
            id,
            bytes_transferred,
            speed,
        });
    }

    async fn transfer_finished(&mut self, id: TransferId, result: Result<()>) {
        let active = match self.active.remove(&id) {
            Some(active) => active,
            None => return,
        };
        active.offer_connection.unpin();
        self.pool.release_token(active.token);

        match result {
            Ok(()) => {
                log::info!("Upload {} to {} completed", active.filename, active.username);
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.mark_completed();
                }
                self.emit(id);
                self.transfers.remove(&id);
            }
            Err(_) if active.cancelled.load(Ordering::Acquire) => {
                log::info!("Upload {} to {} cancelled", active.filename, active.username);
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.mark_cancelled();
                }
                self.emit(id);
                self.transfers.remove(&id);
            }
            Err(e) => {
                log::info!(
                    "Upload {} to {} failed: {}",
                    active.filename,
                    active.username,
                    e
                );
                // a started-then-died upload is reported so the peer can
                // re-queue; rejections and timeouts are not
                if let Error::Io(_) = e {
                    let _ = active.offer_connection.send(PeerMessage::UploadFailed {
                        filename: active.filename.clone(),
                    });
                }
                self.fail(id, e.transfer_reason());
            }
        }
        self.sync_stats();
        self.pump().await;
    }

    async fn cancel(&mut self, id: TransferId) {
        if let Some(pos) = self.queue.iter().position(|q| q.id == id) {
            self.queue.remove(pos);
            if let Some(transfer) = self.transfers.get_mut(&id) {
                transfer.mark_cancelled();
            }
            self.emit(id);
            self.transfers.remove(&id);
            self.sync_stats();
            self.broadcast_places();
            return;
        }
        if let Some(token) = self
            .pending
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(token, _)| *token)
        {
            self.pending.remove(&token);
            self.pool.release_token(token);
            if let Some(transfer) = self.transfers.get_mut(&id) {
                transfer.mark_cancelled();
            }
            self.emit(id);
            self.transfers.remove(&id);
            self.sync_stats();
            self.pump().await;
            return;
        }
        if let Some(active) = self.active.get(&id) {
            // the streaming task notices between chunks and reports back
            active.cancelled.store(true, Ordering::Release);
        }
    }

    /// Marks a transfer failed and forgets it. Callers outside `pump` must
    /// pump afterwards to refill the freed slot.
    fn fail(&mut self, id: TransferId, reason: impl Into<String>) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.mark_failed(reason);
        }
        self.emit(id);
        self.transfers.remove(&id);
        self.sync_stats();
    }

    fn sync_stats(&self) {
        self.stats
            .active
            .store(self.in_flight() as u32, Ordering::Release);
        self.stats
            .queued
            .store(self.queue.len() as u32, Ordering::Release);
    }

    fn emit(&self, id: TransferId) {
        if let Some(transfer) = self.transfers.get(&id) {
            let _ = self
                .events
                .send(EngineEvent::TransferUpdated(transfer.clone()));
        }
    }
}

/// Everything a streaming task needs, detached from the manager.
struct StreamTask {
    id: TransferId,
    username: String,
    local_path: PathBuf,
    size: u64,
    token: u32,
    our_username: String,
    server: ServerHandle,
    pool: PoolHandle,
    inbox: mpsc::Sender<UploadMsg>,
    dial_timeout: std::time::Duration,
    indirect_timeout: std::time::Duration,
    speed_cap: Option<u64>,
    cancelled: Arc<AtomicBool>,
}

impl StreamTask {
    async fn run(self, pierce: oneshot::Receiver<Result<FileConnection>>) {
        let id = self.id;
        let mut inbox = self.inbox.clone();
        let result = self.open_and_stream(pierce).await;
        let _ = inbox.send(UploadMsg::Finished { id, result }).await;
    }

    async fn open_and_stream(
        &self,
        pierce: oneshot::Receiver<Result<FileConnection>>,
    ) -> Result<()> {
        let conn = self.open_channel(pierce).await?;
        self.stream_file(conn).await
    }

    /// Opens the file channel: tell the server about the token first, then
    /// race a direct dial against the peer's pierce.
    async fn open_channel(
        &self,
        pierce: oneshot::Receiver<Result<FileConnection>>,
    ) -> Result<FileConnection> {
        // first, so the peer can connect back if our dial loses the race
        self.server
            .connect_to_peer(self.token, &self.username, ConnectionType::File)
            .await?;

        let mut pierce = pierce.fuse();

        let dial = async {
            let addr = self.pool.resolve_address(&self.username).await?;
            let mut conn =
                FileConnection::connect_direct(addr, &self.our_username, self.dial_timeout)
                    .await?;
            // the transfer init: our token, bare on the wire
            conn.send_u32_le(self.token).await?;
            Ok::<FileConnection, Error>(conn)
        }
        .fuse();
        pin_mut!(dial);

        let direct_result = futures::select! {
            direct = dial => direct,
            pierced = pierce => {
                return match pierced {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::ChannelClosed),
                };
            }
        };

        match direct_result {
            Ok(conn) => Ok(conn),
            Err(direct_err) => {
                log::info!(
                    "Direct file channel to {} failed ({}), awaiting pierce",
                    self.username,
                    direct_err
                );
                match tokio::time::timeout(self.indirect_timeout, pierce).await {
                    Ok(Ok(Ok(conn))) => Ok(conn),
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(_)) => Err(Error::ChannelClosed),
                    Err(_) => {
                        // neither route worked; tell the server the offer
                        // is dead
                        let _ = self
                            .server
                            .cant_connect_to_peer(self.token, &self.username)
                            .await;
                        Err(Error::PeerUnreachable)
                    }
                }
            }
        }
    }

    /// Reads the peer's resume offset and pushes `local_path[offset..]`.
    async fn stream_file(&self, mut conn: FileConnection) -> Result<()> {
        let offset = conn.receive_u64_le(self.indirect_timeout).await?;
        if offset > self.size {
            return Err(Error::Protocol("resume offset past end of file"));
        }
        let mut inbox = self.inbox.clone();
        let _ = inbox
            .send(UploadMsg::Started {
                id: self.id,
                offset,
            })
            .await;

        let mut file = tokio::fs::File::open(&self.local_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut counter = ThruputCounter::new();
        let mut sent = offset;
        let mut buf = vec![0u8; CHUNK_SIZE];

        while sent < self.size {
            if self.cancelled.load(Ordering::Acquire) {
                log::info!("Upload of {:?} cancelled mid-stream", self.local_path);
                conn.close().await;
                return Err(Error::PeerRejected("Cancelled".to_owned()));
            }

            let want = CHUNK_SIZE.min((self.size - sent) as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                // the file shrank under us
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "shared file truncated while uploading",
                )));
            }
            conn.send_raw(&buf[..n]).await?;
            sent += n as u64;
            counter.record(n as u64);

            let _ = inbox
                .send(UploadMsg::Progress {
                    id: self.id,
                    bytes_transferred: sent,
                    speed: counter.avg(),
                })
                .await;

            // the cap is enforced by sleeping proportionally to the chunk
            if let Some(cap) = self.speed_cap {
                if cap > 0 {
                    let secs = n as f64 / cap as f64;
                    tokio::time::delay_for(std::time::Duration::from_secs_f64(secs)).await;
                }
            }
        }

        conn.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::codec::FileAttribute;
    use crate::peer::PeerCommand;
    use crate::pool::PeerConnectionPool;
    use crate::share::{InMemoryShares, SharedFile};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Brings up a manager against a discarding server and a real pool
    /// task, sharing one on-disk file across `file_count` shared paths.
    async fn manager(
        max_concurrent: usize,
        file_count: usize,
    ) -> (
        UploadHandle,
        UnboundedReceiver<EngineEvent>,
        Arc<UploadStats>,
    ) {
        let path = std::env::temp_dir().join(format!(
            "crateseek-upload-test-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::write(&path, vec![7u8; 1024]).unwrap();

        let files = (0..file_count)
            .map(|i| SharedFile {
                shared_path: format!("music\\song{}.mp3", i),
                local_path: path.clone(),
                size: 1024,
                extension: "mp3".to_owned(),
                attributes: vec![FileAttribute { place: 0, value: 320 }],
            })
            .collect();
        let shares = Arc::new(InMemoryShares::new(files));

        let server = ServerHandle::detached();
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (_server_events_tx, server_events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::channel(64);
        let (files_tx, _files_rx) = tokio::sync::mpsc::channel(64);
        let pool = PeerConnectionPool::spawn(
            crate::conf::EngineConf::new(0),
            "me".to_owned(),
            server.clone(),
            server_events_rx,
            inbound_tx,
            files_tx,
            events_tx.clone(),
        );

        let mut conf = TransferConf::new(std::env::temp_dir());
        conf.max_concurrent_uploads = max_concurrent;
        let stats = Arc::new(UploadStats::default());
        let handle = UploadManager::spawn(
            conf,
            crate::conf::EngineConf::new(0),
            "me".to_owned(),
            shares,
            server,
            pool,
            events_tx,
            stats.clone(),
            Arc::new(AtomicU64::new(1)),
        );
        (handle, events_rx, stats)
    }

    async fn queue_upload(handle: &UploadHandle, peer: &PeerHandle, user: &str, file: usize) {
        handle
            .send(UploadMsg::Peer(InboundMessage {
                username: user.to_owned(),
                message: PeerMessage::QueueUpload {
                    filename: format!("music\\song{}.mp3", file),
                },
                reply: peer.clone(),
            }))
            .await
            .unwrap();
    }

    /// Drains whatever the manager sent to the peer so far.
    async fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PeerCommand>) -> Vec<PeerMessage> {
        tokio::time::delay_for(Duration::from_millis(200)).await;
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let PeerCommand::Send(msg) = cmd {
                out.push(msg);
            }
        }
        out
    }

    #[tokio::test]
    async fn per_user_queue_limit_denies_the_51st() {
        // cap 0 keeps everything queued so only admission is in play
        let (handle, _events, _stats) = manager(0, 51).await;
        let (peer, mut peer_rx) = PeerHandle::detached("x");

        for i in 0..51 {
            queue_upload(&handle, &peer, "x", i).await;
        }

        let sent = drain(&mut peer_rx).await;
        let denied: Vec<_> = sent
            .iter()
            .filter_map(|m| match m {
                PeerMessage::UploadDenied { filename, reason } => {
                    Some((filename.clone(), reason.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].0, "music\\song50.mp3");
        assert_eq!(denied[0].1, "Too many files queued");

        // the direct admission replies carry positions 1..=50
        let places: Vec<u32> = sent
            .iter()
            .filter_map(|m| match m {
                PeerMessage::PlaceInQueue { place, .. } => Some(*place),
                _ => None,
            })
            .collect();
        assert!(places.contains(&1));
        assert!(places.contains(&50));
        assert!(!places.contains(&51));
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_the_cap() {
        let (handle, _events, stats) = manager(3, 10).await;
        let (peer, mut peer_rx) = PeerHandle::detached("x");

        for i in 0..10 {
            queue_upload(&handle, &peer, "x", i).await;
        }

        let sent = drain(&mut peer_rx).await;
        let offers: Vec<u32> = sent
            .iter()
            .filter_map(|m| match m {
                PeerMessage::TransferRequest { token, .. } => Some(*token),
                _ => None,
            })
            .collect();
        assert_eq!(offers.len(), 3);
        assert_eq!(stats.active.load(Ordering::Acquire), 3);

        // a rejection frees the slot and the next queued file is offered
        handle
            .send(UploadMsg::Peer(InboundMessage {
                username: "x".to_owned(),
                message: PeerMessage::TransferResponse {
                    token: offers[0],
                    allowed: false,
                    reason: Some("Banned".to_owned()),
                },
                reply: peer.clone(),
            }))
            .await
            .unwrap();

        let sent = drain(&mut peer_rx).await;
        let new_offers = sent
            .iter()
            .filter(|m| matches!(m, PeerMessage::TransferRequest { .. }))
            .count();
        assert_eq!(new_offers, 1);
        assert_eq!(stats.active.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn a_full_user_cannot_starve_another() {
        let (handle, _events, _stats) = manager(0, 51).await;
        let (peer_a, mut rx_a) = PeerHandle::detached("a");
        let (peer_b, mut rx_b) = PeerHandle::detached("b");

        for i in 0..50 {
            queue_upload(&handle, &peer_a, "a", i).await;
        }
        // user a is at the allowance; their next is denied, b's first is not
        queue_upload(&handle, &peer_a, "a", 50).await;
        queue_upload(&handle, &peer_b, "b", 50).await;

        let sent_a = drain(&mut rx_a).await;
        assert!(sent_a
            .iter()
            .any(|m| matches!(m, PeerMessage::UploadDenied { .. })));

        let sent_b = drain(&mut rx_b).await;
        assert!(sent_b
            .iter()
            .any(|m| matches!(m, PeerMessage::PlaceInQueue { place: 51, .. })));
        assert!(!sent_b
            .iter()
            .any(|m| matches!(m, PeerMessage::UploadDenied { .. })));
    }

    #[tokio::test]
    async fn duplicate_request_reports_position_instead_of_requeueing() {
        let (handle, _events, _stats) = manager(0, 2).await;
        let (peer, mut peer_rx) = PeerHandle::detached("x");

        queue_upload(&handle, &peer, "x", 0).await;
        queue_upload(&handle, &peer, "x", 1).await;
        queue_upload(&handle, &peer, "x", 0).await;

        let sent = drain(&mut peer_rx).await;
        let places: Vec<(String, u32)> = sent
            .iter()
            .filter_map(|m| match m {
                PeerMessage::PlaceInQueue { filename, place } => {
                    Some((filename.clone(), *place))
                }
                _ => None,
            })
            .collect();
        // the repeat got the existing position and the queue did not grow
        assert!(places.contains(&("music\\song0.mp3".to_owned(), 1)));
        assert!(places.iter().all(|(_, p)| *p <= 2));
    }
}
