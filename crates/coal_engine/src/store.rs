//! Storage adaptor contract between the engine and the backing store.
//!
//! Any ordered byte-string store works as long as it can accept writes into
//! an in-memory staging surface that later reads observe, and can promise on
//! a sync commit that everything accepted so far survives a crash.

use anyhow::Result;

/// Durability level of a batch commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Leave the writes in the store's log buffer; the store flushes them on
    /// its own schedule. A later sync commit flushes them too, because the
    /// log is written in acceptance order.
    Async,
    /// Return only after every write accepted so far is durable on disk.
    Sync,
}

/// Write accumulator handed to update mutators.
///
/// One batch is shared by every update of a flush interval, so all methods
/// take `&self` and must be safe to call from concurrent mutators; the
/// engine's per-key locks serialize same-key callers, nothing more. Writes
/// become visible to reads as soon as they are accepted; durability arrives
/// with a sync commit.
pub trait StorageBatch: Send + Sync + 'static {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Read `key`, observing every write accepted before this call, this
    /// batch's own writes included.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Append a no-op log record so a sync commit has bytes to sync even
    /// when no user write landed since the previous commit.
    fn log_marker(&self, tag: &[u8]) -> Result<()>;

    /// Commit at the requested durability level. A sync commit covers every
    /// write accepted before the call, including writes staged through
    /// earlier batches of the same store.
    fn commit(&self, durability: Durability) -> Result<()>;

    /// Number of put/delete operations accepted by this batch.
    fn op_count(&self) -> usize;
}

/// Ordered byte-string store backing the engine.
pub trait StorageAdaptor: Send + Sync + 'static {
    type Batch: StorageBatch;

    /// Fresh, empty write accumulator.
    fn new_batch(&self) -> Self::Batch;

    /// Latest visible value for `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}
