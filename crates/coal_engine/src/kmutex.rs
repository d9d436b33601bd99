//! Per-key exclusive locks, keyed by 64-bit hash.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Grants exclusive access per 64-bit key.
///
/// Holders of distinct keys proceed in parallel; a second locker of the same
/// key blocks until the first releases. Fairness is best-effort: a key that
/// is continuously re-taken by other callers can starve a waiter.
pub struct KeyedMutex {
    held: Mutex<HashSet<u64>>,
    unlocked: Condvar,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            unlocked: Condvar::new(),
        }
    }

    /// Block until `key` is unheld, then mark it held.
    ///
    /// The returned guard releases the key on drop.
    pub fn lock(&self, key: u64) -> KeyedMutexGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        while held.contains(&key) {
            held = self
                .unlocked
                .wait(held)
                .unwrap_or_else(|p| p.into_inner());
        }
        held.insert(key);
        KeyedMutexGuard { owner: self, key }
    }

    /// Whether `key` is currently held by some caller.
    #[cfg(test)]
    fn is_held(&self, key: u64) -> bool {
        let held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.contains(&key)
    }

    fn release(&self, key: u64) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&key);
        // Each waiter's wake condition depends on its own key being absent,
        // so this must be a broadcast: notify_one could pick a waiter whose
        // key is still held and leave the right one sleeping.
        self.unlocked.notify_all();
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one key of a [`KeyedMutex`]; releases it on drop.
pub struct KeyedMutexGuard<'a> {
    owner: &'a KeyedMutex,
    key: u64,
}

impl Drop for KeyedMutexGuard<'_> {
    fn drop(&mut self) {
        self.owner.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_is_exclusive() {
        let mutex = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = mutex.lock(7);
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!mutex.is_held(7));
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let mutex = Arc::new(KeyedMutex::new());
        let _held = mutex.lock(1);

        let other = Arc::clone(&mutex);
        let done = thread::spawn(move || {
            let _guard = other.lock(2);
        });
        // Key 2 must be lockable while key 1 is held.
        done.join().unwrap();
    }

    #[test]
    fn drop_releases_and_wakes_waiter() {
        let mutex = Arc::new(KeyedMutex::new());
        let guard = mutex.lock(42);

        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let _guard = mutex.lock(42);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!mutex.is_held(42));
    }
}
