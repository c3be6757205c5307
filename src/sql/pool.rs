//! SQLite connection pool.

use crate::config::PoolConfig;
use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A connection checked out of the pool. Released when dropped.
pub type PooledConnection<'a> = MutexGuard<'a, Connection>;

/// A fixed set of ready-to-use connections to one database file.
pub struct SqlitePool {
    /// Canonical database path; identifies the database across pools.
    credentials: String,
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl SqlitePool {
    /// Open `config.connections` connections to `config.path`.
    pub fn open(config: PoolConfig) -> Result<Self> {
        let count = config.connections.max(1);
        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            connections.push(Mutex::new(open_connection(&config)?));
        }

        // The file exists once the first connection is open.
        let credentials = std::fs::canonicalize(&config.path)?
            .to_string_lossy()
            .into_owned();

        tracing::debug!(db = %credentials, connections = count, "opened sqlite pool");

        Ok(Self {
            credentials,
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Check out a connection, preferring an idle one.
    pub fn acquire(&self) -> PooledConnection<'_> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let len = self.connections.len();
        for offset in 0..len {
            if let Some(guard) = self.connections[(start + offset) % len].try_lock() {
                return guard;
            }
        }
        self.connections[start % len].lock()
    }

    /// Identity of the underlying database.
    pub fn credentials(&self) -> &str {
        &self.credentials
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }
}

fn open_connection(config: &PoolConfig) -> Result<Connection> {
    let connection = Connection::open(&config.path)?;
    connection.busy_timeout(config.busy_timeout)?;
    if config.wal {
        let _mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }
    Ok(connection)
}
