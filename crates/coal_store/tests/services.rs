//! Counter and sequence services against a real engine and store.

use std::sync::Arc;
use std::time::Duration;

use coal_engine::{Engine, EngineOptions, FjallStore, FlushHandle};
use coal_store::{Counters, Sequences};
use tempfile::TempDir;

fn start_engine(path: &std::path::Path) -> (Arc<Engine<FjallStore>>, FlushHandle) {
    let store = FjallStore::open(path).unwrap();
    let engine = Arc::new(Engine::new(
        store,
        EngineOptions {
            idle_sleep: Duration::from_micros(200),
        },
    ));
    let flush = engine.start().unwrap();
    (engine, flush)
}

#[test]
fn counters_add_get_delete() {
    let dir = TempDir::new().unwrap();
    let (engine, flush) = start_engine(dir.path());
    let counters = Counters::new(Arc::clone(&engine));

    assert_eq!(counters.get("acc", "visits").unwrap(), None);
    assert_eq!(counters.add("acc", "visits", 1).unwrap(), 1);
    assert_eq!(counters.add("acc", "visits", 10).unwrap(), 11);
    assert_eq!(counters.add("acc", "visits", -5).unwrap(), 6);
    assert_eq!(counters.get("acc", "visits").unwrap(), Some(6));

    // Same id under a different account is a different counter.
    assert_eq!(counters.add("other", "visits", 3).unwrap(), 3);
    assert_eq!(counters.get("acc", "visits").unwrap(), Some(6));

    counters.delete("acc", "visits").unwrap();
    assert_eq!(counters.get("acc", "visits").unwrap(), None);

    flush.shutdown();
}

#[test]
fn sequences_are_monotonic_and_delete_restarts() {
    let dir = TempDir::new().unwrap();
    let (engine, flush) = start_engine(dir.path());
    let sequences = Sequences::new(Arc::clone(&engine));

    assert_eq!(sequences.get("acc", "orders").unwrap(), None);
    assert_eq!(sequences.next("acc", "orders").unwrap(), 1);
    assert_eq!(sequences.next("acc", "orders").unwrap(), 2);
    assert_eq!(sequences.next("acc", "orders").unwrap(), 3);
    assert_eq!(sequences.get("acc", "orders").unwrap(), Some(3));

    sequences.delete("acc", "orders").unwrap();
    assert_eq!(sequences.get("acc", "orders").unwrap(), None);
    assert_eq!(sequences.next("acc", "orders").unwrap(), 1);

    flush.shutdown();
}

#[test]
fn counters_and_sequences_survive_engine_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (engine, flush) = start_engine(dir.path());
        let counters = Counters::new(Arc::clone(&engine));
        let sequences = Sequences::new(Arc::clone(&engine));

        assert_eq!(counters.add("acc", "c", 41).unwrap(), 41);
        assert_eq!(sequences.next("acc", "s").unwrap(), 1);
        assert_eq!(sequences.next("acc", "s").unwrap(), 2);

        flush.shutdown();
    }

    let (engine, flush) = start_engine(dir.path());
    let counters = Counters::new(Arc::clone(&engine));
    let sequences = Sequences::new(Arc::clone(&engine));

    assert_eq!(counters.get("acc", "c").unwrap(), Some(41));
    // The sequence resumes where it left off instead of reissuing values.
    assert_eq!(sequences.next("acc", "s").unwrap(), 3);

    flush.shutdown();
}

#[test]
fn concurrent_counter_adds_serialize() {
    const WRITERS: usize = 6;
    const ROUNDS: i64 = 20;

    let dir = TempDir::new().unwrap();
    let (engine, flush) = start_engine(dir.path());
    let counters = Arc::new(Counters::new(Arc::clone(&engine)));

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let counters = Arc::clone(&counters);
        handles.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                counters.add("acc", "shared", 1).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        counters.get("acc", "shared").unwrap(),
        Some(WRITERS as i64 * ROUNDS)
    );

    flush.shutdown();
}
