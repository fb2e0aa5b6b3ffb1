// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

//! A SoulSeek peer-to-peer engine.
//!
//! The crate speaks the SoulSeek wire protocol to the central server and to
//! a mesh of peers: searches, transfer queueing and delivery, and
//! server-assisted NAT traversal. The host supplies a share index through
//! the [`share::ShareManager`] trait, drives the engine through
//! [`engine::EngineHandle`], and observes everything through the
//! [`event::EngineEvent`] stream. Rendering, preferences and share
//! indexing live above this crate.

pub mod conf;
mod counter;
pub mod distributed;
mod download;
pub mod engine;
pub mod error;
pub mod event;
pub mod peer;
mod pool;
pub mod server;
pub mod share;
pub mod transfer;
mod upload;
mod wire;

pub use conf::Conf;
pub use engine::{Engine, EngineHandle};
pub use error::{Error, Result};
pub use event::EngineEvent;
pub use transfer::{Transfer, TransferStatus};

/// Identifies one transfer for its whole observable life. Allocated from a
/// single counter across both directions.
pub type TransferId = u64;

/// The 32-bit correlator for requests whose responses arrive on a
/// different connection than the request.
pub type Token = u32;

/// Capacity of the bounded channels between component tasks. Full inboxes
/// push back on the producing connections rather than buffering without
/// bound.
pub(crate) const CHANNEL_CAPACITY: usize = 64;
