//! Polling message bus over a `<table>_messages` table.

use super::types::{BusState, ChangeMessage, Delivery, Subscriber, SubscriberId};
use crate::error::{Result, StorageError};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::sql::SqlitePool;
use crate::types::{messages_table, validate_identifier, MessageId};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Lifecycle {
    state: BusState,
    task: Option<TaskHandle>,
}

/// Ordered, process-local pub/sub over an append-only SQL table.
///
/// Every row gets a database-assigned, strictly increasing id. A poll tick
/// selects rows past the cursor in id order and hands each to every
/// subscriber. The cursor starts at the newest id present when the bus is
/// opened, so history is never replayed.
pub struct ReplicationBus {
    pool: Arc<SqlitePool>,
    /// Message table name.
    table: String,
    /// Highest id already delivered (or skipped as undecodable).
    last_seen: AtomicI64,
    /// Serializes poll ticks.
    poll_lock: Mutex<()>,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
    next_subscriber: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl ReplicationBus {
    /// Open the bus replicating `base_table`, creating its message table if needed.
    pub fn open(pool: Arc<SqlitePool>, base_table: &str) -> Result<Self> {
        validate_identifier(base_table)?;
        let table = messages_table(base_table);

        let newest: i64 = {
            let conn = pool.acquire();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                     id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     payload TEXT NOT NULL\
                 );",
                table
            ))?;
            conn.query_row(
                &format!("SELECT COALESCE(MAX(id), 0) FROM {}", table),
                [],
                |row| row.get(0),
            )?
        };

        tracing::debug!(table = %table, cursor = newest, "opened replication bus");

        Ok(Self {
            pool,
            table,
            last_seen: AtomicI64::new(newest),
            poll_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            lifecycle: Mutex::new(Lifecycle {
                state: BusState::Created,
                task: None,
            }),
        })
    }

    // --- Subscribers ---

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // --- Publishing ---

    /// Append a message on a pooled connection.
    ///
    /// The local cursor is not touched; the sender sees its own message on a
    /// later tick like every other subscriber.
    pub fn send_message(&self, message: &ChangeMessage) -> Result<MessageId> {
        let conn = self.pool.acquire();
        self.send_message_in(&conn, message)
    }

    /// Append a message using the caller's connection or transaction.
    pub fn send_message_in(&self, conn: &Connection, message: &ChangeMessage) -> Result<MessageId> {
        if self.state() == BusState::Stopped {
            return Err(StorageError::BusStopped(self.table.clone()));
        }

        let payload = message.to_payload()?;
        conn.execute(
            &format!("INSERT INTO {} (payload) VALUES (?1)", self.table),
            params![payload],
        )?;
        Ok(MessageId(conn.last_insert_rowid()))
    }

    // --- Polling ---

    /// Schedule the poll tick. Idempotent while polling.
    ///
    /// The lifecycle lock is not held while the scheduler runs, so a
    /// scheduler may run the first tick before returning.
    pub fn setup_sync(self: &Arc<Self>, scheduler: &dyn Scheduler, interval: Duration) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                BusState::Polling => return Ok(()),
                BusState::Stopped => return Err(StorageError::BusStopped(self.table.clone())),
                BusState::Created => lifecycle.state = BusState::Polling,
            }
        }

        let bus = Arc::downgrade(self);
        let table = self.table.clone();
        let scheduled = scheduler.schedule_periodic(
            interval,
            Box::new(move || {
                let Some(bus) = bus.upgrade() else {
                    return;
                };
                if let Err(e) = bus.poll_once() {
                    tracing::warn!(table = %table, error = %e, "poll tick failed, retrying next tick");
                }
            }),
        );

        let mut lifecycle = self.lifecycle.lock();
        let mut handle = match scheduled {
            Ok(handle) => handle,
            Err(e) => {
                if lifecycle.state == BusState::Polling {
                    lifecycle.state = BusState::Created;
                }
                return Err(e);
            }
        };

        if lifecycle.state == BusState::Stopped {
            drop(lifecycle);
            handle.cancel();
            return Err(StorageError::BusStopped(self.table.clone()));
        }

        lifecycle.task = Some(handle);
        tracing::info!(table = %self.table, ?interval, "replication polling started");
        Ok(())
    }

    /// Run one poll tick now. Returns the number of messages delivered.
    ///
    /// If the query fails the cursor is left unchanged. Rows whose payload
    /// cannot be decoded are logged and counted as seen. A subscriber that
    /// panics is logged and does not stop delivery to the others.
    pub fn poll_once(&self) -> Result<usize> {
        let _tick = self.poll_lock.lock();
        if self.state() == BusState::Stopped {
            return Ok(0);
        }

        let cursor = self.last_seen.load(Ordering::SeqCst);
        let batch = self.fetch_after(cursor)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, sub)| Arc::clone(sub))
            .collect();

        let mut delivered = 0;
        for (id, payload) in batch {
            let decoded = payload.and_then(|p| ChangeMessage::from_payload(&p));
            match decoded {
                Ok(message) => {
                    let delivery = Delivery {
                        id: MessageId(id),
                        message,
                    };
                    for subscriber in &subscribers {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| subscriber(&delivery)));
                        if outcome.is_err() {
                            tracing::error!(table = %self.table, id, "subscriber panicked while handling message");
                        }
                    }
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(table = %self.table, id, error = %e, "skipping undecodable message");
                }
            }
            self.last_seen.store(id, Ordering::SeqCst);
        }

        tracing::debug!(table = %self.table, delivered, cursor = self.last_seen.load(Ordering::SeqCst), "poll tick");
        Ok(delivered)
    }

    /// Read every row past `cursor`, in id order.
    fn fetch_after(&self, cursor: i64) -> Result<Vec<(i64, Result<String>)>> {
        let conn = self.pool.acquire();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, payload FROM {} WHERE id > ?1 ORDER BY id ASC",
            self.table
        ))?;
        let mut rows = stmt.query(params![cursor])?;

        let mut batch = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload = row
                .get::<_, String>(1)
                .map_err(|e| StorageError::Decode(e.to_string()));
            batch.push((id, payload));
        }
        Ok(batch)
    }

    // --- Lifecycle ---

    /// Stop polling for good. A tick already running completes.
    pub fn stop(&self) {
        let task = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == BusState::Stopped {
                return;
            }
            lifecycle.state = BusState::Stopped;
            lifecycle.task.take()
        };

        if let Some(mut task) = task {
            task.cancel();
        }
        tracing::info!(table = %self.table, "replication bus stopped");
    }

    pub fn state(&self) -> BusState {
        self.lifecycle.lock().state
    }

    pub fn last_seen(&self) -> MessageId {
        MessageId(self.last_seen.load(Ordering::SeqCst))
    }

    /// Message table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn credentials(&self) -> &str {
        self.pool.credentials()
    }
}
