//! Registry memoizing one bus per (database, table).

use super::poller::ReplicationBus;
use super::types::BusState;
use crate::error::Result;
use crate::sql::SqlitePool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// (credentials, base table)
type BusKey = (String, String);

/// Process-wide owner of replication buses.
///
/// Every cache replicating the same table through the same database shares
/// one bus, and therefore one cursor and one poll task. Create one registry
/// per process (or per test).
#[derive(Default)]
pub struct BusRegistry {
    buses: Mutex<HashMap<BusKey, Arc<ReplicationBus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus for `table` on `pool`'s database, opening it on first use.
    ///
    /// A stopped bus is replaced by a fresh one.
    pub fn bus(&self, pool: &Arc<SqlitePool>, table: &str) -> Result<Arc<ReplicationBus>> {
        let key = (pool.credentials().to_string(), table.to_string());
        let mut buses = self.buses.lock();

        if let Some(bus) = buses.get(&key) {
            if bus.state() != BusState::Stopped {
                return Ok(Arc::clone(bus));
            }
        }

        let bus = Arc::new(ReplicationBus::open(Arc::clone(pool), table)?);
        buses.insert(key, Arc::clone(&bus));
        Ok(bus)
    }

    /// Look up an already-open bus without creating one.
    pub fn get(&self, credentials: &str, table: &str) -> Option<Arc<ReplicationBus>> {
        self.buses
            .lock()
            .get(&(credentials.to_string(), table.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.buses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.lock().is_empty()
    }

    /// Stop every bus and forget them.
    pub fn stop_all(&self) {
        let buses: Vec<Arc<ReplicationBus>> = self.buses.lock().drain().map(|(_, bus)| bus).collect();
        for bus in buses {
            bus.stop();
        }
    }
}
