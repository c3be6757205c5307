//! SQL backend: connection pool and table-backed map handler.

mod handler;
mod pool;

pub use handler::SqlStorageHandler;
pub use pool::{PooledConnection, SqlitePool};
