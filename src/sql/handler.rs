//! Map persistence over a two-column SQL table.

use super::pool::SqlitePool;
use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::handler::StorageHandler;
use crate::types::{messages_table, validate_identifier, KeyColumn, MessageId, TableKey};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Persists a `K -> V` map as one row per key: `(key PRIMARY KEY, value TEXT)`.
///
/// The key column type comes from `K::COLUMN`; values are stored as codec text.
/// Absence of a row means absence of the key.
pub struct SqlStorageHandler<K, V, C = JsonCodec> {
    pool: Arc<SqlitePool>,
    table: String,
    codec: C,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> SqlStorageHandler<K, V, C>
where
    K: TableKey,
    C: Codec<V>,
{
    /// Open the handler with the default codec, creating the table if needed.
    pub fn new(pool: Arc<SqlitePool>, table: &str) -> Result<Self>
    where
        C: Default,
    {
        Self::with_codec(pool, table, C::default())
    }

    pub fn with_codec(pool: Arc<SqlitePool>, table: &str, codec: C) -> Result<Self> {
        validate_identifier(table)?;

        {
            let conn = pool.acquire();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\"key\" {} PRIMARY KEY, \"value\" TEXT NOT NULL);",
                table,
                K::COLUMN.sql_type()
            ))?;
        }

        Ok(Self {
            pool,
            table: table.to_string(),
            codec,
            _marker: PhantomData,
        })
    }

    /// Read every row. Rows that fail to decode are logged and skipped.
    pub fn load_all(&self) -> Result<HashMap<K, V>> {
        let conn = self.pool.acquire();
        self.read_rows(&conn)
    }

    /// Read every row together with the newest id in the message table, both
    /// from one read snapshot.
    ///
    /// Every message with an id at or below the returned one is already
    /// reflected in the rows. The message table must exist.
    pub(crate) fn load_with_watermark(&self) -> Result<(HashMap<K, V>, MessageId)> {
        let mut conn = self.pool.acquire();
        let tx = conn.transaction()?;
        let map = self.read_rows(&tx)?;
        let newest: i64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {}", self.messages_table()),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((map, MessageId(newest)))
    }

    fn read_rows(&self, conn: &Connection) -> Result<HashMap<K, V>> {
        let mut stmt = conn.prepare(&format!("SELECT \"key\", \"value\" FROM {}", self.table))?;
        let mut rows = stmt.query([])?;

        let mut map = HashMap::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.next()? {
            let key: rusqlite::Result<String> = row.get(0);
            let value: rusqlite::Result<String> = row.get(1);

            let decoded = match (key, value) {
                (Ok(key), Ok(value)) => K::from_column(&key)
                    .and_then(|k| self.codec.decode(&value).map(|v| (k, v)))
                    .map_err(|e| (key, e.to_string())),
                (Ok(key), Err(e)) => Err((key, e.to_string())),
                (Err(e), _) => Err((String::from("<unreadable>"), e.to_string())),
            };

            match decoded {
                Ok((k, v)) => {
                    map.insert(k, v);
                }
                Err((key, error)) => {
                    skipped += 1;
                    tracing::warn!(table = %self.table, key = %key, error = %error, "skipping corrupt row");
                }
            }
        }

        tracing::debug!(table = %self.table, rows = map.len(), skipped, "loaded table");
        Ok(map)
    }

    /// Upsert the row for `key`, or delete it when `value` is `None`.
    pub fn insert(&self, key: &K, value: Option<&V>) -> Result<()> {
        let encoded = self.encode_value(value)?;
        let conn = self.pool.acquire();
        self.write_encoded(&conn, &key.to_column(), encoded.as_deref())
    }

    /// Single-statement write on a caller-provided connection or transaction.
    pub(crate) fn write_encoded(
        &self,
        conn: &Connection,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        match value {
            Some(value) => {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (\"key\", \"value\") VALUES (?1, ?2) \
                         ON CONFLICT(\"key\") DO UPDATE SET \"value\" = excluded.\"value\"",
                        self.table
                    ),
                    params![key, value],
                )?;
            }
            None => {
                conn.execute(
                    &format!("DELETE FROM {} WHERE \"key\" = ?1", self.table),
                    params![key],
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn encode_value(&self, value: Option<&V>) -> Result<Option<String>> {
        value.map(|v| self.codec.encode(v)).transpose()
    }

    pub(crate) fn decode_value(&self, text: &str) -> Result<V> {
        self.codec.decode(text)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the companion replication table.
    pub fn messages_table(&self) -> String {
        messages_table(&self.table)
    }

    pub fn pool(&self) -> &Arc<SqlitePool> {
        &self.pool
    }

    pub fn credentials(&self) -> &str {
        self.pool.credentials()
    }

    pub fn key_column(&self) -> KeyColumn {
        K::COLUMN
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn value_type(&self) -> &'static str {
        std::any::type_name::<V>()
    }
}

impl<K, V, C> StorageHandler<HashMap<K, V>> for SqlStorageHandler<K, V, C>
where
    K: TableKey,
    C: Codec<V>,
{
    fn load(&self) -> Result<Option<HashMap<K, V>>> {
        self.load_all().map(Some)
    }
}
