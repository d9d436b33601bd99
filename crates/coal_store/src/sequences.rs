//! Durable sequences: strictly monotonic per-id number dispensers.

use std::sync::Arc;

use anyhow::Result;
use coal_engine::{Engine, StorageAdaptor, StorageBatch, UpdateError};

use crate::keys::{decode_u64, encode_key, encode_u64, TAG_SEQUENCE};

pub struct Sequences<S: StorageAdaptor> {
    engine: Arc<Engine<S>>,
}

impl<S: StorageAdaptor> Sequences<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self { engine }
    }

    /// Issue the next value. The first call on a fresh id returns 1, and a
    /// value is never handed out twice, even across restarts: the update is
    /// durable before the caller sees it.
    pub fn next(&self, account: &str, id: &str) -> Result<u64, UpdateError> {
        let key = encode_key(TAG_SEQUENCE, account, id);
        let mut issued = 0u64;
        self.engine.update(&key, |batch| {
            let current = match batch.get(&key)? {
                Some(raw) => decode_u64(&raw)?,
                None => 0,
            };
            issued = current + 1;
            batch.put(&key, &encode_u64(issued))
        })?;
        Ok(issued)
    }

    /// Last issued value, read straight from the store.
    pub fn get(&self, account: &str, id: &str) -> Result<Option<u64>> {
        let key = encode_key(TAG_SEQUENCE, account, id);
        match self.engine.store().get(&key)? {
            Some(raw) => Ok(Some(decode_u64(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove the sequence. A later `next` restarts from 1.
    pub fn delete(&self, account: &str, id: &str) -> Result<(), UpdateError> {
        let key = encode_key(TAG_SEQUENCE, account, id);
        self.engine.update(&key, |batch| batch.delete(&key))
    }
}
