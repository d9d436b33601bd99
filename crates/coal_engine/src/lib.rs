//! Serialized read-modify-write storage engine.
//!
//! The engine accepts many concurrent key-scoped updates, serializes updates
//! that target the same key, and coalesces the durability cost of all of them
//! into a small number of physical log syncs. A caller that gets `Ok(())`
//! back from [`Engine::update`] knows its writes are on disk.
//!
//! The write path: an update takes a per-key lock, runs a caller-supplied
//! mutator against the in-progress write batch, releases the lock, and then
//! parks on the flush signal for that batch. A dedicated flush task rotates
//! the batch, issues one sync commit for everything accumulated since the
//! previous rotation, and wakes every parked caller at once.

pub mod engine;
pub mod fjall_store;
pub mod kmutex;
pub mod notify;
pub mod store;

pub use engine::{Engine, EngineOptions, EngineStats, EngineStatsSnapshot, FlushHandle, UpdateError};
pub use fjall_store::{FjallBatch, FjallStore};
pub use kmutex::KeyedMutex;
pub use notify::{FlushSignal, Notifier};
pub use store::{Durability, StorageAdaptor, StorageBatch};
