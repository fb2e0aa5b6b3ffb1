//! Event fan-out plumbing and the engine's observable event stream.
//!
//! Several subsystems need the same server pushes (the upload manager, the
//! download manager and the pool all care about peer addresses), so a single
//! listener slot cannot work. The registry hands every registered listener
//! its own channel and dispatches in registration order; removal is
//! explicit.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::peer::codec::{ConnectionType, FileEntry};
use crate::peer::Direction;
use crate::server::codec::LoginResult;
use crate::transfer::Transfer;
use crate::TransferId;

/// Identifies one registered listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered set of event listeners.
///
/// Dispatch clones the event once per listener, in registration order.
/// Listeners whose receiving end is gone are pruned on the next dispatch.
pub(crate) struct Listeners<T> {
    next_id: u64,
    entries: Vec<(ListenerId, UnboundedSender<T>)>,
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Registers a new listener and returns its id and event stream.
    pub fn add(&mut self) -> (ListenerId, UnboundedReceiver<T>) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.push((id, tx));
        (id, rx)
    }

    /// Removes a listener; returns whether it was registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Delivers `event` to every live listener, in registration order.
    pub fn dispatch(&mut self, event: &T) {
        self.entries
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What the engine reports to its host.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum EngineEvent {
    /// The login exchange finished, either way.
    LoggedIn(LoginResult),
    /// The server TCP link died; server-dependent pending work has failed.
    ServerDisconnected,
    /// A peer link reached the connected state.
    PeerConnected {
        username: String,
        channel: ConnectionType,
        direction: Direction,
    },
    /// A peer link left the pool.
    PeerDisconnected {
        username: String,
        channel: ConnectionType,
    },
    /// One peer's results for a search token.
    SearchResults {
        token: u32,
        username: String,
        files: Vec<FileEntry>,
        slot_free: bool,
        avg_speed: u32,
        queue_length: u64,
    },
    /// A transfer changed state; the snapshot carries the details.
    TransferUpdated(Transfer),
    /// Periodic progress while bytes are moving.
    TransferProgress {
        id: TransferId,
        bytes_transferred: u64,
        speed: u64,
    },
    /// An incoming private message.
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },
    /// A line said in a room we are in.
    RoomMessage {
        room: String,
        username: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_receive_in_registration_order() {
        let mut listeners: Listeners<u32> = Listeners::new();
        let (_id_a, mut rx_a) = listeners.add();
        let (_id_b, mut rx_b) = listeners.add();

        listeners.dispatch(&1);
        listeners.dispatch(&2);

        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), 2);
        assert_eq!(rx_b.try_recv().unwrap(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), 2);
    }

    #[test]
    fn removal_is_explicit_and_exact() {
        let mut listeners: Listeners<u32> = Listeners::new();
        let (id_a, mut rx_a) = listeners.add();
        let (_id_b, mut rx_b) = listeners.add();

        assert!(listeners.remove(id_a));
        assert!(!listeners.remove(id_a));

        listeners.dispatch(&7);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), 7);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut listeners: Listeners<u32> = Listeners::new();
        let (_id_a, rx_a) = listeners.add();
        let (_id_b, _rx_b) = listeners.add();
        drop(rx_a);

        listeners.dispatch(&1);
        assert_eq!(listeners.len(), 1);
    }
}
