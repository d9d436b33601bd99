//! Fjall-backed storage adaptor.
//!
//! User data lives in a single `data` partition. Batch writes go straight
//! into the partition (memtable plus buffered journal), which makes them
//! visible to reads immediately and safe to issue from concurrent mutators;
//! a sync commit persists the journal and with it every write accepted
//! earlier. The `marks` partition holds the one no-op record a flush writes
//! so the journal always has fresh bytes to sync.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::store::{Durability, StorageAdaptor, StorageBatch};

const DATA_PARTITION: &str = "data";
const MARKS_PARTITION: &str = "marks";
/// Key of the single no-op marker record, overwritten on every flush.
const MARKER_KEY: &[u8] = b"last_flush";

pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    marks: PartitionHandle,
}

impl FjallStore {
    /// Open (or create) a store at `path`.
    ///
    /// Journal persistence is manual: nothing hits disk until a sync commit,
    /// so the engine's flush cadence is the only durability schedule.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .manual_journal_persist(true)
            .open()
            .context("open fjall keyspace")?;
        Self::with_keyspace(Arc::new(keyspace))
    }

    /// Wrap an already-open keyspace (the host owns its configuration).
    pub fn with_keyspace(keyspace: Arc<Keyspace>) -> Result<Self> {
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .context("open data partition")?;
        let marks = keyspace
            .open_partition(MARKS_PARTITION, PartitionCreateOptions::default())
            .context("open marks partition")?;
        Ok(Self {
            keyspace,
            data,
            marks,
        })
    }
}

impl StorageAdaptor for FjallStore {
    type Batch = FjallBatch;

    fn new_batch(&self) -> FjallBatch {
        FjallBatch {
            keyspace: Arc::clone(&self.keyspace),
            data: self.data.clone(),
            marks: self.marks.clone(),
            ops: AtomicUsize::new(0),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.data.get(key).context("read data partition")?;
        Ok(value.map(|slice| slice.to_vec()))
    }
}

/// Accumulator for one flush interval's writes.
///
/// Partition handles are internally synchronized, so concurrent mutators may
/// write through the same batch without extra locking here.
pub struct FjallBatch {
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    marks: PartitionHandle,
    ops: AtomicUsize,
}

impl StorageBatch for FjallBatch {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.insert(key, value).context("stage put")?;
        self.ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.remove(key).context("stage delete")?;
        self.ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.data.get(key).context("read through batch")?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    fn log_marker(&self, tag: &[u8]) -> Result<()> {
        self.marks
            .insert(MARKER_KEY, tag)
            .context("append flush marker")
    }

    fn commit(&self, durability: Durability) -> Result<()> {
        match durability {
            // Writes are already in the journal buffer in acceptance order.
            Durability::Async => Ok(()),
            Durability::Sync => self
                .keyspace
                .persist(PersistMode::SyncAll)
                .context("sync journal"),
        }
    }

    fn op_count(&self) -> usize {
        self.ops.load(Ordering::Relaxed)
    }
}
