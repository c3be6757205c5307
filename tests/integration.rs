//! Integration tests for cross-process replication.
//!
//! Each "process" gets its own pool, registry and scheduler over one shared
//! database file.

use serde::{Deserialize, Serialize};
use sqlmirror::{
    BusRegistry, ManualScheduler, MsgPackCodec, PoolConfig, ReplicatedMapCache, ReplicationConfig,
    SqlStorageHandler, SqlitePool, ThreadScheduler,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

struct Process {
    cache: ReplicatedMapCache<String, u64>,
    scheduler: ManualScheduler,
    _registry: BusRegistry,
}

impl Process {
    fn tick(&self) {
        self.scheduler.tick();
    }

    fn get(&self, key: &str) -> Option<u64> {
        self.cache.get(&key.to_string())
    }
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("shared.db")
}

fn open_cache(path: &Path, table: &str) -> ReplicatedMapCache<String, u64> {
    let pool = Arc::new(SqlitePool::open(PoolConfig::at(path)).unwrap());
    let handler = SqlStorageHandler::new(pool, table).unwrap();
    ReplicatedMapCache::open(handler, HashMap::new).unwrap()
}

fn process(path: &Path, table: &str) -> Process {
    let cache = open_cache(path, table);
    let registry = BusRegistry::new();
    let scheduler = ManualScheduler::new();
    cache
        .setup_replication(&registry, &scheduler, &ReplicationConfig::default(), None)
        .unwrap();
    Process {
        cache,
        scheduler,
        _registry: registry,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// --- Round trip ---

#[test]
fn test_update_then_fresh_open() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let cache = open_cache(&path, "players_gold");
    cache.insert("alice".into(), 100).unwrap();
    cache.insert("bob".into(), 7).unwrap();
    cache.remove("bob".into()).unwrap();
    drop(cache);

    let reopened = open_cache(&path, "players_gold");
    assert_eq!(reopened.get(&"alice".to_string()), Some(100));
    assert!(!reopened.contains_key(&"bob".to_string()));
    assert_eq!(reopened.len(), 1);
}

#[test]
fn test_loaded_rows_override_defaults() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    open_cache(&path, "players_gold")
        .insert("alice".into(), 100)
        .unwrap();

    let pool = Arc::new(SqlitePool::open(PoolConfig::at(&path)).unwrap());
    let handler: SqlStorageHandler<String, u64> =
        SqlStorageHandler::new(Arc::clone(&pool), "players_gold").unwrap();
    let cache = ReplicatedMapCache::open(handler, || {
        HashMap::from([("alice".to_string(), 1), ("carol".to_string(), 50)])
    })
    .unwrap();

    assert_eq!(cache.get(&"alice".to_string()), Some(100));
    assert_eq!(cache.get(&"carol".to_string()), Some(50));

    // Defaults are not persisted.
    let handler: SqlStorageHandler<String, u64> =
        SqlStorageHandler::new(pool, "players_gold").unwrap();
    assert!(!handler.load_all().unwrap().contains_key("carol"));
}

// --- Cross-process scenario ---

#[test]
fn test_two_process_gold_scenario() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = process(&path, "players_gold");
    let b = process(&path, "players_gold");

    a.cache.insert("alice".into(), 100).unwrap();
    assert_eq!(a.get("alice"), Some(100));
    assert_eq!(b.get("alice"), None);

    b.tick();
    assert_eq!(b.get("alice"), Some(100));

    a.cache.remove("alice".into()).unwrap();
    assert_eq!(b.get("alice"), Some(100));
    b.tick();
    assert_eq!(b.get("alice"), None);
}

#[test]
fn test_replication_with_background_polling() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let config = ReplicationConfig {
        poll_interval: Duration::from_millis(10),
    };

    let a = open_cache(&path, "players_gold");
    let b = open_cache(&path, "players_gold");
    let registry_a = BusRegistry::new();
    let registry_b = BusRegistry::new();
    a.setup_replication(&registry_a, &ThreadScheduler::default(), &config, None)
        .unwrap();
    b.setup_replication(&registry_b, &ThreadScheduler::default(), &config, None)
        .unwrap();

    a.insert("alice".into(), 100).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        b.get(&"alice".to_string()) == Some(100)
    }));

    a.remove("alice".into()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !b.contains_key(&"alice".to_string())
    }));

    registry_a.stop_all();
    registry_b.stop_all();
}

#[test]
fn test_remote_change_callback() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = process(&path, "players_gold");

    let b = open_cache(&path, "players_gold");
    let registry = BusRegistry::new();
    let scheduler = ManualScheduler::new();
    let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    b.setup_replication(
        &registry,
        &scheduler,
        &ReplicationConfig::default(),
        Some(Box::new(move |key: &String, value: Option<&u64>| {
            sink.lock().push((key.clone(), value.copied()));
        })),
    )
    .unwrap();

    a.cache.insert("alice".into(), 3).unwrap();
    a.cache.remove("alice".into()).unwrap();
    scheduler.tick();

    assert_eq!(
        *changes.lock(),
        vec![("alice".to_string(), Some(3)), ("alice".to_string(), None)]
    );

    // Remote changes are not re-published.
    assert_eq!(b.bus().unwrap().last_seen().0, 2);
    a.tick();
    assert_eq!(a.cache.bus().unwrap().last_seen().0, 2);
}

#[test]
fn test_late_joiner_sees_history_through_load() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = process(&path, "players_gold");

    a.cache.insert("m1".into(), 1).unwrap();
    a.cache.insert("m2".into(), 2).unwrap();
    a.cache.insert("m3".into(), 3).unwrap();

    let late = open_cache(&path, "players_gold");
    let seen = Arc::new(parking_lot::Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let scheduler = ManualScheduler::new();
    late.setup_replication(
        &BusRegistry::new(),
        &scheduler,
        &ReplicationConfig::default(),
        Some(Box::new(move |_: &String, _: Option<&u64>| {
            *counter.lock() += 1;
        })),
    )
    .unwrap();

    scheduler.tick();
    assert_eq!(*seen.lock(), 0);
    assert_eq!(late.len(), 3);
    assert_eq!(late.get(&"m2".to_string()), Some(2));
}

#[test]
fn test_writes_between_open_and_replication_are_kept() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = process(&path, "players_gold");
    a.cache.insert("bob".into(), 7).unwrap();

    let b = open_cache(&path, "players_gold");
    assert_eq!(b.get(&"bob".to_string()), Some(7));

    // Committed after b loaded but before b's bus exists.
    a.cache.insert("alice".into(), 100).unwrap();
    a.cache.remove("bob".into()).unwrap();

    let scheduler = ManualScheduler::new();
    b.setup_replication(
        &BusRegistry::new(),
        &scheduler,
        &ReplicationConfig::default(),
        None,
    )
    .unwrap();
    scheduler.tick();

    assert_eq!(b.get(&"alice".to_string()), Some(100));
    assert!(!b.contains_key(&"bob".to_string()));
    assert_eq!(b.snapshot(), open_cache(&path, "players_gold").snapshot());

    a.cache.insert("alice".into(), 101).unwrap();
    scheduler.tick();
    assert_eq!(b.get(&"alice".to_string()), Some(101));
}

// --- Conflicts ---

#[test]
fn test_last_writer_wins() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = process(&path, "contested");
    let b = process(&path, "contested");

    a.cache.insert("x".into(), 1).unwrap();
    b.cache.insert("x".into(), 2).unwrap();

    a.tick();
    b.tick();
    assert_eq!(a.get("x"), Some(2));
    assert_eq!(b.get("x"), Some(2));
    assert_eq!(open_cache(&path, "contested").get(&"x".to_string()), Some(2));
}

#[test]
fn test_concurrent_writers_converge() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let a = Arc::new(process(&path, "contested"));
    let b = Arc::new(process(&path, "contested"));

    let writers: Vec<_> = [(Arc::clone(&a), 0u64), (Arc::clone(&b), 1000u64)]
        .into_iter()
        .map(|(p, base)| {
            thread::spawn(move || {
                for i in 0..50 {
                    p.cache.insert(format!("k{}", i % 5), base + i).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    a.tick();
    b.tick();

    let durable = open_cache(&path, "contested").snapshot();
    assert_eq!(durable.len(), 5);
    assert_eq!(a.cache.snapshot(), durable);
    assert_eq!(b.cache.snapshot(), durable);
}

#[test]
fn test_concurrent_local_writers_match_table() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let cache = Arc::new(open_cache(&path, "contested"));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("k{}", i % 3);
                    if i % 7 == 0 {
                        cache.remove(key).unwrap();
                    } else {
                        cache.insert(key, t * 1000 + i).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert!(!cache.is_replicating());
    assert_eq!(cache.snapshot(), open_cache(&path, "contested").snapshot());
}

// --- Channels ---

#[test]
fn test_tables_replicate_independently() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let gold_a = process(&path, "gold");
    let gold_b = process(&path, "gold");
    let xp_b = process(&path, "xp");

    gold_a.cache.insert("alice".into(), 5).unwrap();
    gold_b.tick();
    xp_b.tick();

    assert_eq!(gold_b.get("alice"), Some(5));
    assert_eq!(xp_b.get("alice"), None);
}

#[test]
fn test_shared_bus_within_process() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let registry = BusRegistry::new();
    let scheduler = ManualScheduler::new();
    let config = ReplicationConfig::default();

    let pool = Arc::new(SqlitePool::open(PoolConfig::at(&path)).unwrap());
    let first: ReplicatedMapCache<String, u64> = ReplicatedMapCache::open(
        SqlStorageHandler::new(Arc::clone(&pool), "gold").unwrap(),
        HashMap::new,
    )
    .unwrap();
    let second: ReplicatedMapCache<String, u64> = ReplicatedMapCache::open(
        SqlStorageHandler::new(Arc::clone(&pool), "gold").unwrap(),
        HashMap::new,
    )
    .unwrap();

    let bus1 = first
        .setup_replication(&registry, &scheduler, &config, None)
        .unwrap();
    let bus2 = second
        .setup_replication(&registry, &scheduler, &config, None)
        .unwrap();
    assert!(Arc::ptr_eq(&bus1, &bus2));
    assert_eq!(bus1.subscriber_count(), 2);
    assert_eq!(scheduler.task_count(), 1);

    first.insert("alice".into(), 9).unwrap();
    scheduler.tick();
    assert_eq!(second.get(&"alice".to_string()), Some(9));
}

// --- Key and codec variants ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Home {
    world: String,
    x: i32,
    y: i32,
    z: i32,
}

#[test]
fn test_uuid_keys_with_msgpack() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let open = || {
        let pool = Arc::new(SqlitePool::open(PoolConfig::at(&path)).unwrap());
        let handler: SqlStorageHandler<Uuid, Home, MsgPackCodec> =
            SqlStorageHandler::new(pool, "homes").unwrap();
        ReplicatedMapCache::open(handler, HashMap::new).unwrap()
    };

    let a = open();
    let b = open();
    let scheduler = ManualScheduler::new();
    b.setup_replication(
        &BusRegistry::new(),
        &scheduler,
        &ReplicationConfig::default(),
        None,
    )
    .unwrap();
    a.setup_replication(
        &BusRegistry::new(),
        &ManualScheduler::new(),
        &ReplicationConfig::default(),
        None,
    )
    .unwrap();

    let player = Uuid::new_v4();
    let home = Home {
        world: "overworld".to_string(),
        x: 10,
        y: 64,
        z: -3,
    };
    a.insert(player, home.clone()).unwrap();
    scheduler.tick();

    assert_eq!(b.get(&player), Some(home.clone()));
    assert_eq!(open().get(&player), Some(home));
}
