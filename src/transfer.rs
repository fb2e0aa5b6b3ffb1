//! The observable record of an upload or download.

use std::time::Instant;

use crate::peer::codec::TransferDirection;
use crate::TransferId;

/// Where a transfer currently stands. `Completed`, `Failed` and `Cancelled`
/// are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Admitted to the queue, not yet offered or accepted.
    Queued,
    /// Negotiating the offer or opening the file channel.
    Connecting,
    /// Bytes are moving.
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// A snapshot of one transfer, reported to the host on every transition and
/// periodically while transferring.
#[derive(Clone, Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub username: String,
    pub filename: String,
    pub size: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    /// Rolling average, bytes per second.
    pub speed: u64,
    /// 1-based position while queued on the remote side, if known.
    pub queue_position: Option<u32>,
    pub started_at: Option<Instant>,
    pub error: Option<String>,
}

impl Transfer {
    pub fn new(
        id: TransferId,
        username: String,
        filename: String,
        size: u64,
        direction: TransferDirection,
    ) -> Self {
        Self {
            id,
            username,
            filename,
            size,
            direction,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            speed: 0,
            queue_position: None,
            started_at: None,
            error: None,
        }
    }

    pub(crate) fn mark_connecting(&mut self) {
        self.status = TransferStatus::Connecting;
    }

    pub(crate) fn mark_transferring(&mut self) {
        self.status = TransferStatus::Transferring;
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.bytes_transferred = self.size;
        self.speed = 0;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TransferStatus::Failed;
        self.error = Some(reason.into());
        self.speed = 0;
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = TransferStatus::Cancelled;
        self.speed = 0;
    }
}
