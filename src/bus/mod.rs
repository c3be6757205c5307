//! Replication bus: a SQL table used as an ordered message channel.
//!
//! Each replicated table `T` has a companion `T_messages` table with an
//! auto-incrementing id. Publishers append rows; every process polls for rows
//! past its cursor and delivers them to its subscribers in id order.
//!
//! Delivery guarantees:
//! - Per subscriber, messages arrive in strictly increasing id order.
//! - A bus starts at the newest id present when opened; nothing older is replayed.
//! - An undecodable row is logged and skipped, never re-delivered.
//! - A failed poll query leaves the cursor untouched and is retried next tick.
//!
//! # Example
//!
//! ```ignore
//! let registry = BusRegistry::new();
//! let bus = registry.bus(&pool, "players_gold")?;
//! bus.subscribe(|delivery| println!("{} -> {:?}", delivery.message.key, delivery.message.value));
//! bus.setup_sync(&ThreadScheduler::default(), Duration::from_millis(50))?;
//! ```

mod poller;
mod registry;
mod types;

pub use poller::ReplicationBus;
pub use registry::BusRegistry;
pub use types::{BusState, ChangeMessage, Delivery, Subscriber, SubscriberId};
