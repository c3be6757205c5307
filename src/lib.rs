//! # sqlmirror
//!
//! An in-memory map cache that is written through to a SQL table and kept
//! consistent across processes sharing that database, using a companion
//! message table as the replication channel.
//!
//! ## Core Concepts
//!
//! - **Handlers**: load persisted values; [`SqlStorageHandler`] maps a table to a `HashMap`
//! - **Materialized map**: the process-local copy every read is served from
//! - **Replication bus**: a polled `<table>_messages` table delivering changes in id order
//! - **Replicated cache**: database write, then local update, then publish
//!
//! ## Example
//!
//! ```ignore
//! use sqlmirror::{BusRegistry, PoolConfig, ReplicatedMapCache, ReplicationConfig,
//!                 SqlStorageHandler, SqlitePool, ThreadScheduler};
//! use std::{collections::HashMap, sync::Arc};
//!
//! let pool = Arc::new(SqlitePool::open(PoolConfig::at("./shared.db"))?);
//! let handler: SqlStorageHandler<String, u64> = SqlStorageHandler::new(pool, "players_gold")?;
//! let cache = ReplicatedMapCache::open(handler, HashMap::new)?;
//!
//! // Reloads the table, so writes made by others since `open` are not missed.
//! let registry = BusRegistry::new();
//! cache.setup_replication(&registry, &ThreadScheduler::default(), &ReplicationConfig::default(), None)?;
//!
//! cache.insert("alice".to_string(), 100)?;
//! assert_eq!(cache.get(&"alice".to_string()), Some(100));
//! ```

pub mod bus;
pub mod cache;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod handler;
pub mod scheduler;
pub mod sql;
pub mod types;

// Re-exports
pub use bus::{BusRegistry, BusState, ChangeMessage, Delivery, ReplicationBus, SubscriberId};
pub use cache::{RemoteChange, ReplicatedMapCache};
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use config::{PoolConfig, ReplicationConfig};
pub use container::{MaterializedMap, StorageContainer};
pub use error::{Result, StorageError};
pub use handler::StorageHandler;
pub use scheduler::{ManualScheduler, Scheduler, Task, TaskHandle, ThreadScheduler};
pub use sql::{PooledConnection, SqlStorageHandler, SqlitePool};
pub use types::{KeyColumn, MessageId, TableKey};
