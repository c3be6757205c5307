//! Configuration for connection pools and replication.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Connection pool configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path to the SQLite database file shared by all processes.
    pub path: PathBuf,

    /// Number of connections handed out round-robin.
    /// Default: 4
    pub connections: usize,

    /// Upper bound on how long a statement waits for a locked database.
    /// Default: 5s
    pub busy_timeout: Duration,

    /// Use the WAL journal so readers do not block the writer.
    pub wal: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage.db"),
            connections: 4,
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }
}

impl PoolConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Replication configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Interval between poll ticks of the message table.
    /// Default: 50ms
    pub poll_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}
