//! The download manager: the requester's side of the transfer protocol.
//!
//! We ask a peer to queue an upload, accept the offer it eventually sends,
//! and then take delivery over an F channel the uploader opens — either by
//! dialing our listener directly or, when it cannot reach us, by having us
//! pierce back through the server relay. The receiving task sends the
//! resume offset (the size of whatever partial file is already on disk)
//! and writes the stream to disk until the full size has arrived.
//!
//! Like the upload side, one task owns every map and all inputs flow
//! through its inbox.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::conf::TransferConf;
use crate::counter::ThruputCounter;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::peer::codec::{PeerMessage, TransferDirection};
use crate::peer::{FileConnection, InboundMessage, PeerHandle};
use crate::pool::{IncomingFile, PoolHandle};
use crate::transfer::Transfer;
use crate::upload::CHUNK_SIZE;
use crate::TransferId;

/// Deadline for the offset exchange and the transfer-init token read.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A stream that stops moving for this long is dead.
const RECEIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A download we have asked for but whose offer has not arrived yet.
struct RequestedDownload {
    id: TransferId,
    username: String,
    filename: String,
    dest: PathBuf,
}

/// An accepted offer waiting for its F channel.
struct PendingDownload {
    id: TransferId,
    username: String,
    filename: String,
    size: u64,
    token: u32,
    dest: PathBuf,
}

/// A download with bytes moving.
struct ActiveDownload {
    username: String,
    filename: String,
    cancelled: Arc<AtomicBool>,
}

/// What the manager task accepts.
pub(crate) enum DownloadMsg {
    /// Host asked for a file.
    Enqueue {
        username: String,
        filename: String,
        /// Expected size if the host knows it (from search results).
        size: u64,
        /// Overrides the default destination under the download directory.
        dest: Option<PathBuf>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    /// A routed P-channel message: `TransferRequest`, `PlaceInQueue`,
    /// `UploadDenied` or `UploadFailed`.
    Peer(InboundMessage),
    /// An F channel arrived for us.
    File(IncomingFile),
    /// A receiving task read its init token off a fresh channel.
    TokenRead {
        token: u32,
        conn: FileConnection,
    },
    /// A receiving task started writing at the given offset.
    Started { id: TransferId, offset: u64 },
    Progress {
        id: TransferId,
        bytes_transferred: u64,
        speed: u64,
    },
    Finished { id: TransferId, result: Result<()> },
    Cancel { id: TransferId },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct DownloadHandle {
    tx: mpsc::Sender<DownloadMsg>,
}

impl DownloadHandle {
    pub async fn send(&self, msg: DownloadMsg) -> Result<()> {
        self.tx.clone().send(msg).await.map_err(Error::from)
    }

    pub async fn enqueue(
        &self,
        username: &str,
        filename: &str,
        size: u64,
        dest: Option<PathBuf>,
    ) -> Result<TransferId> {
        let (reply, response) = oneshot::channel();
        self.send(DownloadMsg::Enqueue {
            username: username.to_owned(),
            filename: filename.to_owned(),
            size,
            dest,
            reply,
        })
        .await?;
        response.await?
    }
}

pub(crate) struct DownloadManager {
    conf: TransferConf,
    pool: PoolHandle,
    events: mpsc::UnboundedSender<EngineEvent>,

    /// Sent `QueueUpload`, no offer yet; keyed by (user, remote path).
    requested: HashMap<(String, String), RequestedDownload>,
    /// Accepted offers keyed by the uploader's token.
    pending: HashMap<u32, PendingDownload>,
    active: HashMap<TransferId, ActiveDownload>,
    transfers: HashMap<TransferId, Transfer>,

    /// Shared with the upload side; see there.
    ids: Arc<AtomicU64>,
    inbox: mpsc::Sender<DownloadMsg>,
}

impl DownloadManager {
    pub fn spawn(
        conf: TransferConf,
        pool: PoolHandle,
        events: mpsc::UnboundedSender<EngineEvent>,
        ids: Arc<AtomicU64>,
    ) -> DownloadHandle {
        let (tx, rx) = mpsc::channel(crate::CHANNEL_CAPACITY);
        let manager = Self {
            conf,
            pool,
            events,
            requested: HashMap::new(),
            pending: HashMap::new(),
            active: HashMap::new(),
            transfers: HashMap::new(),
            ids,
            inbox: tx.clone(),
        };
        tokio::spawn(manager.run(rx));
        DownloadHandle { tx }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<DownloadMsg>) {
        while let Some(msg) = inbox.recv().await {
            match msg {
                DownloadMsg::Enqueue {
                    username,
                    filename,
                    size,
                    dest,
                    reply,
                } => {
                    let result = self.enqueue(username, filename, size, dest).await;
                    let _ = reply.send(result);
                }
                DownloadMsg::Peer(inbound) => self.handle_peer_message(inbound).await,
                DownloadMsg::File(incoming) => self.incoming_file(incoming),
                DownloadMsg::TokenRead { token, conn } => self.token_read(token, conn),
                DownloadMsg::Started { id, offset } => self.transfer_started(id, offset),
                DownloadMsg::Progress {
                    id,
                    bytes_transferred,
                    speed,
                } => self.transfer_progress(id, bytes_transferred, speed),
                DownloadMsg::Finished { id, result } => self.transfer_finished(id, result),
                DownloadMsg::Cancel { id } => self.cancel(id),
                DownloadMsg::Shutdown => break,
            }
        }
        log::info!("Shutting down download manager");
        for (_, active) in self.active.drain() {
            active.cancelled.store(true, Ordering::Release);
        }
    }

    /// Asks `username` to queue `filename` for us.
    async fn enqueue(
        &mut self,
        username: String,
        filename: String,
        size: u64,
        dest: Option<PathBuf>,
    ) -> Result<TransferId> {
        let key = (username.clone(), filename.clone());
        if let Some(existing) = self.requested.get(&key) {
            return Ok(existing.id);
        }

        let peer = self.pool.get_or_open_peer(&username).await?;
        peer.send(PeerMessage::QueueUpload {
            filename: filename.clone(),
        })?;

        let id = self.ids.fetch_add(1, Ordering::AcqRel);
        let dest = dest.unwrap_or_else(|| self.conf.download_dir.join(basename(&filename)));
        let transfer = Transfer::new(
            id,
            username.clone(),
            filename.clone(),
            size,
            TransferDirection::Download,
        );
        self.transfers.insert(id, transfer);
        self.requested.insert(
            key,
            RequestedDownload {
                id,
                username,
                filename,
                dest,
            },
        );
        self.emit(id);
        Ok(id)
    }

    async fn handle_peer_message(&mut self, inbound: InboundMessage) {
        let InboundMessage {
            username,
            message,
            reply,
        } = inbound;
        match message {
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                filename,
                file_size,
            } => {
                self.offer_received(username, token, filename, file_size, reply)
                    .await;
            }
            PeerMessage::PlaceInQueue { filename, place } => {
                if let Some(requested) = self.requested.get(&(username, filename)) {
                    let id = requested.id;
                    if let Some(transfer) = self.transfers.get_mut(&id) {
                        transfer.queue_position = Some(place);
                    }
                    self.emit(id);
                }
            }
            PeerMessage::UploadDenied { filename, reason } => {
                log::info!("{} denied {}: {}", username, filename, reason);
                if let Some(requested) = self.requested.remove(&(username, filename)) {
                    self.fail(requested.id, reason);
                }
            }
            PeerMessage::UploadFailed { filename } => {
                log::info!("{} reports upload of {} failed", username, filename);
                self.peer_side_failure(&username, &filename);
            }
            other => {
                log::debug!(
                    "Download manager ignoring {} message from {}",
                    other.code(),
                    username
                );
            }
        }
    }

    /// The peer offers the file we asked for: accept and wait for its F
    /// channel.
    async fn offer_received(
        &mut self,
        username: String,
        token: u32,
        filename: String,
        file_size: Option<u64>,
        reply: PeerHandle,
    ) {
        let key = (username.clone(), filename.clone());
        let requested = match self.requested.remove(&key) {
            Some(requested) => requested,
            None => {
                log::info!("Unsolicited transfer offer from {} for {}", username, filename);
                let _ = reply.send(PeerMessage::TransferResponse {
                    token,
                    allowed: false,
                    reason: Some("Cancelled".to_owned()),
                });
                return;
            }
        };

        // the uploader's token must be unique among everything live here
        if self.pending.contains_key(&token) {
            log::warn!("Duplicate transfer token {} from {}", token, username);
            let _ = reply.send(PeerMessage::TransferResponse {
                token,
                allowed: false,
                reason: Some("Duplicate transfer token".to_owned()),
            });
            self.requested.insert(key, requested);
            return;
        }

        let size = file_size.unwrap_or(0);
        let id = requested.id;
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.size = size;
            transfer.mark_connecting();
        }
        self.emit(id);

        let _ = reply.send(PeerMessage::TransferResponse {
            token,
            allowed: true,
            reason: None,
        });
        self.pending.insert(
            token,
            PendingDownload {
                id,
                username: username.clone(),
                filename,
                size,
                token,
                dest: requested.dest,
            },
        );

        // a pierce may deliver the channel instead of a direct dial; wire
        // the token into the pool either way
        match self.pool.register_foreign_token(token).await {
            Ok(pierce) => {
                let mut inbox = self.inbox.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(conn)) = pierce.await {
                        let _ = inbox.send(DownloadMsg::TokenRead { token, conn }).await;
                    }
                });
            }
            Err(e) => {
                log::warn!("Cannot register token {}: {}", token, e);
            }
        }
    }

    /// An F channel arrived. A pierced channel knows its token already; a
    /// dialed one leads with the 4-byte transfer init.
    fn incoming_file(&mut self, incoming: IncomingFile) {
        let IncomingFile {
            username,
            mut conn,
            pierce_token,
        } = incoming;

        if let Some(token) = pierce_token {
            if self.pending.contains_key(&token) {
                self.token_read(token, conn);
                return;
            }
            // not ours: fall through and expect an init token on the wire
        }

        let mut inbox = self.inbox.clone();
        tokio::spawn(async move {
            match conn.receive_u32_le(HANDSHAKE_READ_TIMEOUT).await {
                Ok(token) => {
                    let _ = inbox.send(DownloadMsg::TokenRead { token, conn }).await;
                }
                Err(e) => {
                    log::info!("File channel from {} died before init: {}", username, e);
                }
            }
        });
    }

    /// A channel and a token met: match the pending download and start
    /// receiving.
    fn token_read(&mut self, token: u32, conn: FileConnection) {
        let pending = match self.pending.remove(&token) {
            Some(pending) => pending,
            None => {
                log::info!("File channel with unknown token {}, dropping", token);
                return;
            }
        };
        self.pool.release_token(token);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.insert(
            pending.id,
            ActiveDownload {
                username: pending.username.clone(),
                filename: pending.filename.clone(),
                cancelled: cancelled.clone(),
            },
        );

        let inbox = self.inbox.clone();
        tokio::spawn(receive_file(pending, conn, cancelled, inbox));
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
        let _ = self.events.send(EngineEvent::TransferProgress {
            id,
            bytes_transferred,
            speed,
        });
    }

    fn transfer_finished(&mut self, id: TransferId, result: Result<()>) {
        let active = match self.active.remove(&id) {
            Some(active) => active,
            None => return,
        };
        match result {
            Ok(()) => {
                log::info!(
                    "Download {} from {} completed",
                    active.filename,
                    active.username
                );
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.mark_completed();
                }
                self.emit(id);
                self.transfers.remove(&id);
            }
            Err(_) if active.cancelled.load(Ordering::Acquire) => {
                if let Some(transfer) = self.transfers.get_mut(&id) {
                    transfer.mark_cancelled();
                }
                self.emit(id);
                self.transfers.remove(&id);
            }
            Err(e) => {
                log::info!(
                    "Download {} from {} failed: {}",
                    active.filename,
                    active.username,
                    e
                );
                self.fail(id, e.transfer_reason());
            }
        }
    }

    /// The uploader told us a started transfer died on its side; the
    /// matching record fails so the host can re-queue.
    fn peer_side_failure(&mut self, username: &str, filename: &str) {
        if let Some(token) = self
            .pending
            .iter()
            .find(|(_, p)| p.username == username && p.filename == filename)
            .map(|(token, _)| *token)
        {
            if let Some(pending) = self.pending.remove(&token) {
                self.pool.release_token(token);
                self.fail(pending.id, "Peer reported upload failed");
            }
            return;
        }
        let active_id = self
            .active
            .iter()
            .find(|(_, a)| a.username == username && a.filename == filename)
            .map(|(id, _)| *id);
        if let Some(id) = active_id {
            // the receiving task will notice the closed socket; nothing to
            // do here beyond logging
            log::debug!("Upload failure for active download {}", id);
        }
    }

    fn cancel(&mut self, id: TransferId) {
        if let Some(key) = self
            .requested
            .iter()
            .find(|(_, r)| r.id == id)
            .map(|(key, _)| key.clone())
        {
            self.requested.remove(&key);
            if let Some(transfer) = self.transfers.get_mut(&id) {
                transfer.mark_cancelled();
            }
            self.emit(id);
            self.transfers.remove(&id);
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
            return;
        }
        if let Some(active) = self.active.get(&id) {
            active.cancelled.store(true, Ordering::Release);
        }
    }

    fn fail(&mut self, id: TransferId, reason: impl Into<String>) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.mark_failed(reason);
        }
        self.emit(id);
        self.transfers.remove(&id);
    }

    fn emit(&self, id: TransferId) {
        if let Some(transfer) = self.transfers.get(&id) {
            let _ = self
                .events
                .send(EngineEvent::TransferUpdated(transfer.clone()));
        }
    }
}

/// The file part after the remote path's last separator.
fn basename(filename: &str) -> String {
    filename
        .rsplit(|c| c == '\\' || c == '/')
        .next()
        .unwrap_or(filename)
        .to_owned()
}

/// The receiving task: offset exchange, then bytes to disk.
async fn receive_file(
    pending: PendingDownload,
    mut conn: FileConnection,
    cancelled: Arc<AtomicBool>,
    inbox: mpsc::Sender<DownloadMsg>,
) {
    let id = pending.id;
    let mut inbox_done = inbox.clone();
    let result = receive_file_inner(pending, &mut conn, cancelled, inbox).await;
    conn.close().await;
    let _ = inbox_done.send(DownloadMsg::Finished { id, result }).await;
}

async fn receive_file_inner(
    pending: PendingDownload,
    conn: &mut FileConnection,
    cancelled: Arc<AtomicBool>,
    mut inbox: mpsc::Sender<DownloadMsg>,
) -> Result<()> {
    // resume where the partial file left off
    let offset = match tokio::fs::metadata(&pending.dest).await {
        Ok(meta) => meta.len().min(pending.size),
        Err(_) => 0,
    };
    conn.send_u64_le(offset).await?;
    let _ = inbox
        .send(DownloadMsg::Started {
            id: pending.id,
            offset,
        })
        .await;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&pending.dest)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut counter = ThruputCounter::new();
    let mut received = offset;
    let mut buf = vec![0u8; CHUNK_SIZE];

    while received < pending.size {
        if cancelled.load(Ordering::Acquire) {
            log::info!("Download of {} cancelled mid-stream", pending.filename);
            return Err(Error::Timeout("cancelled"));
        }
        let want = CHUNK_SIZE.min((pending.size - received) as usize);
        let n = tokio::time::timeout(RECEIVE_IDLE_TIMEOUT, conn.read_some(&mut buf[..want]))
            .await
            .map_err(|_| Error::Timeout("file data"))??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        counter.record(n as u64);

        let _ = inbox
            .send(DownloadMsg::Progress {
                id: pending.id,
                bytes_transferred: received,
                speed: counter.avg(),
            })
            .await;
    }

    file.flush().await?;

    // a short stream is a failure; anything past `size` is left unread and
    // discarded with the connection
    if received < pending.size {
        return Err(Error::PeerRejected("short read".to_owned()));
    }
    Ok(())
}
