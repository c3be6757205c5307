//! Write-through map cache replicated across processes.

use crate::bus::{BusRegistry, ChangeMessage, Delivery, ReplicationBus, SubscriberId};
use crate::codec::{Codec, JsonCodec};
use crate::config::ReplicationConfig;
use crate::container::MaterializedMap;
use crate::error::{Result, StorageError};
use crate::handler::StorageHandler;
use crate::scheduler::Scheduler;
use crate::sql::SqlStorageHandler;
use crate::types::TableKey;
use parking_lot::{Mutex, RwLock};
use rusqlite::TransactionBehavior;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback fired after a mutation made by another writer is applied locally.
pub type RemoteChange<K, V> = Box<dyn Fn(&K, Option<&V>) + Send + Sync>;

struct Replication {
    bus: Arc<ReplicationBus>,
    subscriber: SubscriberId,
}

/// A `K -> V` map held in memory, written through to a SQL table, and kept
/// consistent with other processes sharing that table.
///
/// Reads never touch the database. Writes go to the database first; the
/// local map only changes once the write has committed.
///
/// With replication enabled, each write commits its row and its replication
/// message in one transaction, so message order is commit order. Every key
/// remembers the id of the message it currently reflects, and older or
/// repeated messages are ignored. All processes therefore converge on the
/// value committed last, and a process's own echoes are no-ops.
pub struct ReplicatedMapCache<K, V, C = JsonCodec> {
    handler: Arc<SqlStorageHandler<K, V, C>>,
    map: Arc<MaterializedMap<K, V>>,
    /// Caller defaults, overlaid again when the map is reseeded.
    defaults: HashMap<K, V>,
    /// Orders unreplicated writes so the map applies them in commit order.
    write_lock: Mutex<()>,
    replication: RwLock<Option<Replication>>,
}

impl<K, V, C> ReplicatedMapCache<K, V, C>
where
    K: TableKey,
    V: Clone + Send + Sync + 'static,
    C: Codec<V> + 'static,
{
    /// Seed the cache from a full table load overlaid on `default`.
    ///
    /// Loaded rows win over defaults. Defaults are not written back.
    pub fn open<F>(handler: SqlStorageHandler<K, V, C>, default: F) -> Result<Self>
    where
        F: FnOnce() -> HashMap<K, V>,
    {
        let defaults = default();
        let mut seeded = defaults.clone();
        seeded.extend(handler.load_or_else(HashMap::new)?);

        tracing::info!(table = %handler.table(), entries = seeded.len(), "opened replicated cache");

        Ok(Self {
            handler: Arc::new(handler),
            map: Arc::new(MaterializedMap::from_map(seeded)),
            defaults,
            write_lock: Mutex::new(()),
            replication: RwLock::new(None),
        })
    }

    // --- Local reads ---

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.keys()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.map.snapshot()
    }

    // --- Writes ---

    /// Set (`Some`) or delete (`None`) `key`.
    ///
    /// On error nothing was committed and the local map is unchanged.
    pub fn update(&self, key: K, value: Option<V>) -> Result<()> {
        let encoded = self.handler.encode_value(value.as_ref())?;
        let column_key = key.to_column();

        let replication = self.replication.read();
        match replication.as_ref() {
            None => {
                let _write = self.write_lock.lock();
                {
                    let conn = self.handler.pool().acquire();
                    self.handler
                        .write_encoded(&conn, &column_key, encoded.as_deref())?;
                }
                self.map.apply(key, value);
            }
            Some(replication) => {
                let message = ChangeMessage {
                    key: column_key,
                    value: encoded,
                    key_column: K::COLUMN,
                    codec: self.handler.codec_name().to_string(),
                    value_type: self.handler.value_type().to_string(),
                };

                let id = {
                    let mut conn = self.handler.pool().acquire();
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    self.handler
                        .write_encoded(&tx, &message.key, message.value.as_deref())?;
                    let id = replication.bus.send_message_in(&tx, &message)?;
                    tx.commit()?;
                    id
                };

                // A newer remote write may already be applied; then this is a no-op.
                self.map.apply_versioned(key, value, id);
            }
        }

        Ok(())
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.update(key, Some(value))
    }

    pub fn remove(&self, key: K) -> Result<()> {
        self.update(key, None)
    }

    // --- Replication ---

    /// Subscribe to the table's bus and start polling it.
    ///
    /// After subscribing, the table is reloaded together with the newest
    /// message id from one snapshot and the map is reseeded from it, so
    /// writes committed since `open` are picked up. Messages up to that id
    /// are then ignored.
    ///
    /// Remote mutations are applied to the local map only; they are neither
    /// re-written to the database nor re-published.
    pub fn setup_replication(
        &self,
        registry: &BusRegistry,
        scheduler: &dyn Scheduler,
        config: &ReplicationConfig,
        on_remote_change: Option<RemoteChange<K, V>>,
    ) -> Result<Arc<ReplicationBus>> {
        let mut replication = self.replication.write();
        if replication.is_some() {
            return Err(StorageError::ReplicationEnabled(
                self.handler.table().to_string(),
            ));
        }

        let bus = registry.bus(self.handler.pool(), self.handler.table())?;

        let handler = Arc::clone(&self.handler);
        let map = Arc::clone(&self.map);
        let subscriber = bus.subscribe(move |delivery| {
            apply_delivery(&handler, &map, on_remote_change.as_deref(), delivery)
        });

        if let Err(e) = self.reseed() {
            bus.unsubscribe(subscriber);
            return Err(e);
        }

        if let Err(e) = bus.setup_sync(scheduler, config.poll_interval) {
            bus.unsubscribe(subscriber);
            return Err(e);
        }

        *replication = Some(Replication {
            bus: Arc::clone(&bus),
            subscriber,
        });
        Ok(bus)
    }

    fn reseed(&self) -> Result<()> {
        let (rows, watermark) = self.handler.load_with_watermark()?;
        let mut seeded = self.defaults.clone();
        seeded.extend(rows);
        tracing::debug!(table = %self.handler.table(), entries = seeded.len(), %watermark, "reseeded before replicating");
        self.map.reseed(seeded, watermark);
        Ok(())
    }

    pub fn is_replicating(&self) -> bool {
        self.replication.read().is_some()
    }

    /// The bus this cache is subscribed to, if replicating.
    pub fn bus(&self) -> Option<Arc<ReplicationBus>> {
        self.replication
            .read()
            .as_ref()
            .map(|r| Arc::clone(&r.bus))
    }

    pub fn handler(&self) -> &SqlStorageHandler<K, V, C> {
        &self.handler
    }
}

impl<K, V, C> Drop for ReplicatedMapCache<K, V, C> {
    fn drop(&mut self) {
        if let Some(replication) = self.replication.get_mut().take() {
            replication.bus.unsubscribe(replication.subscriber);
        }
    }
}

fn apply_delivery<K, V, C>(
    handler: &SqlStorageHandler<K, V, C>,
    map: &MaterializedMap<K, V>,
    on_remote_change: Option<&(dyn Fn(&K, Option<&V>) + Send + Sync)>,
    delivery: &Delivery,
) where
    K: TableKey,
    V: Clone,
    C: Codec<V>,
{
    let message = &delivery.message;
    if message.key_column != K::COLUMN || message.codec != handler.codec_name() {
        tracing::warn!(
            table = %handler.table(),
            id = %delivery.id,
            key_column = %message.key_column,
            codec = %message.codec,
            value_type = %message.value_type,
            "ignoring message for a different key or codec"
        );
        return;
    }

    let decoded = K::from_column(&message.key).and_then(|key| {
        message
            .value
            .as_deref()
            .map(|text| handler.decode_value(text))
            .transpose()
            .map(|value| (key, value))
    });

    let (key, value) = match decoded {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(table = %handler.table(), id = %delivery.id, error = %e, "skipping undecodable change");
            return;
        }
    };

    if map.apply_versioned(key.clone(), value.clone(), delivery.id) {
        tracing::debug!(table = %handler.table(), id = %delivery.id, key = ?key, "applied remote change");
        if let Some(callback) = on_remote_change {
            callback(&key, value.as_ref());
        }
    }
}
