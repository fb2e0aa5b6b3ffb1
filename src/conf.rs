//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The canonical SoulSeek server.
pub const DEFAULT_SERVER_HOST: &str = "server.slsknet.org";
pub const DEFAULT_SERVER_PORT: u16 = 2242;

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub transfer: TransferConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// listen port and the download directory, as it is not sensible to
    /// guess those for the user.
    pub fn new(listen_port: u16, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(listen_port),
            transfer: TransferConf::new(download_dir),
        }
    }
}

/// Configuration of the session and connection plumbing.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The TCP port peers connect to us on. Announced to the server after
    /// login.
    pub listen_port: u16,

    /// The central server address.
    pub server_host: String,
    pub server_port: u16,

    /// Idle P connections older than this with no active transfer are
    /// evicted from the pool.
    pub peer_idle_timeout: Duration,

    /// How long a resolved peer address stays usable without re-asking the
    /// server.
    pub address_cache_ttl: Duration,

    /// Interval of the server keepalive ping.
    pub keepalive_interval: Duration,

    /// Ceiling on a direct TCP dial to a peer.
    pub dial_timeout: Duration,

    /// Ceiling on waiting for the peer to pierce back after a relayed
    /// connect-to-peer request.
    pub indirect_timeout: Duration,
}

impl EngineConf {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            peer_idle_timeout: Duration::from_secs(60),
            address_cache_ttl: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
            indirect_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration of the upload and download managers.
#[derive(Clone, Debug)]
pub struct TransferConf {
    /// The directory downloads land in when the caller gives a bare
    /// destination file name.
    pub download_dir: PathBuf,

    /// Ceiling on simultaneous in-flight uploads. Pending offers count,
    /// since each holds a slot for the peer's expected response.
    pub max_concurrent_uploads: usize,

    /// Per-user ceiling on queued uploads; requests beyond it are denied.
    pub max_queued_per_user: usize,

    /// Optional cap on aggregate upload throughput, in bytes per second.
    pub upload_speed_cap_bps: Option<u64>,

    /// How long a transfer offer may wait for the peer's response.
    pub offer_timeout: Duration,
}

impl TransferConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_concurrent_uploads: 3,
            max_queued_per_user: 50,
            upload_speed_cap_bps: None,
            offer_timeout: Duration::from_secs(60),
        }
    }
}
