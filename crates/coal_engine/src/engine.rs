//! The update/flush coordinator.
//!
//! Callers enter through [`Engine::update`]; a dedicated flush task runs
//! [`Engine::run_flush_loop`]. The engine mutex guards the in-progress batch
//! handle, the update counters and the stopped flag, and is only ever taken
//! for a few memory operations: mutators run under their per-key lock alone,
//! writing through the shared batch. Batch and flush signals rotate together
//! under one engine-lock acquisition, which is what ties every parked caller
//! to a flush that covers its writes.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::kmutex::KeyedMutex;
use crate::notify::{FlushSignal, Notifier};
use crate::store::{Durability, StorageAdaptor, StorageBatch};

/// Number of key-lock shards and notifier shards.
///
/// More shards means less condvar contention and smaller wake fan-out, at a
/// cost of a few KiB. Sized for thousands of concurrent updates.
const SHARD_COUNT: usize = 100;

const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Engine tunables.
#[derive(Clone, Copy, Debug)]
pub struct EngineOptions {
    /// How long the flush loop sleeps after a cycle that found no work.
    /// Bounds the latency floor of an isolated update.
    pub idle_sleep: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }
}

/// Why an update did not complete.
#[derive(Debug)]
pub enum UpdateError {
    /// The engine is draining; no new updates are accepted.
    ShuttingDown,
    /// The caller-supplied mutator failed. Writes it staged before failing
    /// stay in the batch and will be flushed with it.
    Mutator(anyhow::Error),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::ShuttingDown => write!(f, "engine is shutting down"),
            UpdateError::Mutator(err) => write!(f, "update mutator failed: {err}"),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::ShuttingDown => None,
            UpdateError::Mutator(err) => Some(err.as_ref()),
        }
    }
}

struct EngineInner<B> {
    batch: Arc<B>,
    /// Rotation count; identifies which batch a counter contribution hit.
    gen: u64,
    /// Update calls counted against the current batch.
    batched: usize,
    /// Update calls that entered and have not yet returned.
    pending: usize,
    stopped: bool,
}

/// Coalescing durable-update engine over a [`StorageAdaptor`].
pub struct Engine<S: StorageAdaptor> {
    store: S,
    locks: Vec<KeyedMutex>,
    notifiers: Vec<Notifier>,
    inner: Mutex<EngineInner<S::Batch>>,
    idle_sleep: Duration,
    stats: EngineStats,
}

impl<S: StorageAdaptor> Engine<S> {
    pub fn new(store: S, options: EngineOptions) -> Self {
        let batch = Arc::new(store.new_batch());
        Self {
            store,
            locks: (0..SHARD_COUNT).map(|_| KeyedMutex::new()).collect(),
            notifiers: (0..SHARD_COUNT).map(|_| Notifier::new()).collect(),
            inner: Mutex::new(EngineInner {
                batch,
                gen: 0,
                batched: 0,
                pending: 0,
                stopped: false,
            }),
            idle_sleep: options.idle_sleep,
            stats: EngineStats::default(),
        }
    }

    /// The backing store, for read paths that bypass the engine.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Update calls currently in flight.
    pub fn pending_updates(&self) -> usize {
        self.lock_inner().pending
    }

    /// Apply a key-scoped mutation and return once it is durable.
    ///
    /// `mutator` may stage any number of puts and deletes, as long as they
    /// all belong to `key`'s own record range. Two updates with equal keys
    /// run their mutators one after the other; updates with distinct keys
    /// run concurrently apart from shard collisions. Mutators must not call
    /// back into the engine.
    ///
    /// A zero-length key skips the per-key lock entirely; such updates run
    /// unserialized. Reserved for administrative writes that own no key.
    ///
    /// On a mutator error the staged writes are not rolled back; they flush
    /// together with the batch. Callers that need atomicity must stage all
    /// of an update's writes in one mutator invocation.
    pub fn update<F>(&self, key: &[u8], mutator: F) -> Result<(), UpdateError>
    where
        F: FnOnce(&S::Batch) -> anyhow::Result<()>,
    {
        let (batch, entry_gen) = {
            let mut inner = self.lock_inner();
            if inner.stopped {
                self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(UpdateError::ShuttingDown);
            }
            inner.pending += 1;
            // Counted before any write can land, in the same critical
            // section that records which generation the count hit.
            inner.batched += 1;
            (Arc::clone(&inner.batch), inner.gen)
        };
        self.stats.updates_started.fetch_add(1, Ordering::Relaxed);
        // Decrements `pending` on every exit path, early errors and mutator
        // panics included.
        let _pending = PendingGuard { inner: &self.inner };

        let hash = hash_key(key);
        let shard = shard_of(hash);
        let key_guard = if key.is_empty() {
            None
        } else {
            Some(self.locks[shard].lock(hash))
        };

        // Only the per-key lock is held here: mutators on distinct keys run
        // in parallel, and a slow mutator never stalls the engine lock.
        let result = mutator(batch.as_ref());
        drop(key_guard);

        let signal = {
            let mut inner = self.lock_inner();
            // If the batch rotated while the mutator ran, the entry count
            // went to a generation that no longer covers these writes; claim
            // them against the current one so its flush cannot be skipped as
            // empty. A sync commit covers all earlier writes, so the newer
            // generation is always the safe one to wait on.
            if inner.gen != entry_gen {
                inner.batched += 1;
            }
            self.notifiers[shard].current()
        };

        if let Err(err) = result {
            self.stats.mutator_errors.fetch_add(1, Ordering::Relaxed);
            return Err(UpdateError::Mutator(err));
        }
        signal.wait();
        Ok(())
    }

    /// Rotate the batch and make its contents durable.
    ///
    /// Returns the number of updates still in flight, which is what the
    /// flush loop uses to decide when a drain is complete.
    pub fn flush_once(&self) -> usize {
        let (batch, signals, batched, pending) = {
            let mut inner = self.lock_inner();
            let batched = mem::take(&mut inner.batched);
            let pending = inner.pending;
            inner.gen += 1;
            let batch = mem::replace(&mut inner.batch, Arc::new(self.store.new_batch()));
            // Batch and signals swap under the same lock acquisition: every
            // caller parked on one of these signals is counted in `batched`,
            // so a skipped commit provably strands no writes.
            let signals: Vec<Arc<FlushSignal>> =
                self.notifiers.iter().map(Notifier::rotate).collect();
            (batch, signals, batched, pending)
        };

        let cycle = self.stats.flush_cycles.fetch_add(1, Ordering::Relaxed);
        if batched > 0 {
            let started = Instant::now();
            if let Err(err) = batch.log_marker(&cycle.to_be_bytes()) {
                tracing::error!(error = ?err, "flush marker append failed, halting");
                std::process::abort();
            }
            if let Err(err) = batch.commit(Durability::Sync) {
                // Waiters on these signals were promised durability. Waking
                // them after a failed sync would acknowledge writes that may
                // not exist after a crash, so the process halts instead.
                tracing::error!(error = ?err, "sync commit failed, halting");
                std::process::abort();
            }
            self.stats.record_commit(batched, started.elapsed());
        }

        for signal in &signals {
            signal.close();
        }
        pending
    }

    /// Run the flush loop until `shutdown` is set and the engine is drained.
    ///
    /// After the shutdown flag is observed, new updates are rejected and the
    /// loop keeps flushing until no update is in flight.
    pub fn run_flush_loop(&self, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                {
                    let mut inner = self.lock_inner();
                    inner.stopped = true;
                }
                loop {
                    if self.flush_once() == 0 {
                        return;
                    }
                }
            }
            if self.flush_once() == 0 {
                thread::sleep(self.idle_sleep);
            }
        }
    }

    /// Spawn the flush loop on a dedicated thread.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<FlushHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let engine = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("coal-flush".to_string())
            .spawn(move || engine.run_flush_loop(&flag))
            .context("spawn flush thread")?;
        Ok(FlushHandle {
            shutdown,
            thread: Some(thread),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, EngineInner<S::Batch>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Decrements the engine's in-flight counter when an update leaves,
/// regardless of how it leaves.
struct PendingGuard<'a, B> {
    inner: &'a Mutex<EngineInner<B>>,
}

impl<B> Drop for PendingGuard<'_, B> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.pending -= 1;
    }
}

/// Handle to a running flush loop thread.
///
/// `shutdown` drains the engine and joins the thread; dropping the handle
/// does the same best-effort.
pub struct FlushHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushHandle {
    /// Request shutdown and block until the engine is drained.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hash a key for lock and notifier shard selection.
fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}

fn shard_of(hash: u64) -> usize {
    (hash % SHARD_COUNT as u64) as usize
}

/// Hot-path counters, reported through the host's stats surface.
#[derive(Default)]
pub struct EngineStats {
    updates_started: AtomicU64,
    updates_rejected: AtomicU64,
    mutator_errors: AtomicU64,
    flush_cycles: AtomicU64,
    sync_commits: AtomicU64,
    commit_total_us: AtomicU64,
    commit_max_us: AtomicU64,
    coalesced_total: AtomicU64,
    coalesced_max: AtomicU64,
}

impl EngineStats {
    fn record_commit(&self, batched: usize, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.sync_commits.fetch_add(1, Ordering::Relaxed);
        self.commit_total_us.fetch_add(us, Ordering::Relaxed);
        self.commit_max_us.fetch_max(us, Ordering::Relaxed);
        self.coalesced_total.fetch_add(batched as u64, Ordering::Relaxed);
        self.coalesced_max.fetch_max(batched as u64, Ordering::Relaxed);
    }

    /// Snapshot all counters and reset them to zero.
    pub fn snapshot_and_reset(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            updates_started: self.updates_started.swap(0, Ordering::Relaxed),
            updates_rejected: self.updates_rejected.swap(0, Ordering::Relaxed),
            mutator_errors: self.mutator_errors.swap(0, Ordering::Relaxed),
            flush_cycles: self.flush_cycles.swap(0, Ordering::Relaxed),
            sync_commits: self.sync_commits.swap(0, Ordering::Relaxed),
            commit_total_us: self.commit_total_us.swap(0, Ordering::Relaxed),
            commit_max_us: self.commit_max_us.swap(0, Ordering::Relaxed),
            coalesced_total: self.coalesced_total.swap(0, Ordering::Relaxed),
            coalesced_max: self.coalesced_max.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct EngineStatsSnapshot {
    pub updates_started: u64,
    pub updates_rejected: u64,
    pub mutator_errors: u64,
    pub flush_cycles: u64,
    pub sync_commits: u64,
    pub commit_total_us: u64,
    pub commit_max_us: u64,
    pub coalesced_total: u64,
    pub coalesced_max: u64,
}
