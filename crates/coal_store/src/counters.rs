//! Durable counters.
//!
//! Each counter is one record; increments are read-modify-write updates
//! through the engine, so concurrent adds to the same counter serialize and
//! every acknowledged add is durable.

use std::sync::Arc;

use anyhow::Result;
use coal_engine::{Engine, StorageAdaptor, StorageBatch, UpdateError};

use crate::keys::{decode_i64, encode_i64, encode_key, TAG_COUNTER};

pub struct Counters<S: StorageAdaptor> {
    engine: Arc<Engine<S>>,
}

impl<S: StorageAdaptor> Counters<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self { engine }
    }

    /// Add `delta` (may be negative) and return the new value once durable.
    /// A missing counter starts at zero.
    pub fn add(&self, account: &str, id: &str, delta: i64) -> Result<i64, UpdateError> {
        let key = encode_key(TAG_COUNTER, account, id);
        let mut updated = 0i64;
        self.engine.update(&key, |batch| {
            let current = match batch.get(&key)? {
                Some(raw) => decode_i64(&raw)?,
                None => 0,
            };
            updated = current.wrapping_add(delta);
            batch.put(&key, &encode_i64(updated))
        })?;
        Ok(updated)
    }

    /// Current value, read straight from the store.
    pub fn get(&self, account: &str, id: &str) -> Result<Option<i64>> {
        let key = encode_key(TAG_COUNTER, account, id);
        match self.engine.store().get(&key)? {
            Some(raw) => Ok(Some(decode_i64(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove the counter; durable on return.
    pub fn delete(&self, account: &str, id: &str) -> Result<(), UpdateError> {
        let key = encode_key(TAG_COUNTER, account, id);
        self.engine.update(&key, |batch| batch.delete(&key))
    }
}
