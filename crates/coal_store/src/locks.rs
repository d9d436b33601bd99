//! In-memory lease locks.
//!
//! Advisory locks with a hold duration and a bounded acquire wait. Nothing
//! here touches the engine or the store: leases live in RAM only and are
//! gone after a restart. Sharded the same way as the engine's key locks to
//! keep condvar wake fan-out small.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const LOCK_SHARDS: usize = 100;

/// Upper bound applied to client-supplied acquire waits.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

struct Lease {
    token: u64,
    expires_at: Instant,
}

struct LockShard {
    leases: Mutex<HashMap<u64, Lease>>,
    freed: Condvar,
}

pub struct LeaseLocks {
    shards: Vec<LockShard>,
    next_token: AtomicU64,
    max_wait: Duration,
}

impl LeaseLocks {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            shards: (0..LOCK_SHARDS)
                .map(|_| LockShard {
                    leases: Mutex::new(HashMap::new()),
                    freed: Condvar::new(),
                })
                .collect(),
            next_token: AtomicU64::new(0),
            max_wait,
        }
    }

    /// Take the lease for `(account, id)` for `hold`, waiting up to `wait`
    /// (capped at the configured maximum) for it to become free or expire.
    ///
    /// Returns the holder token, or `None` when the wait deadline passes.
    pub fn acquire(
        &self,
        account: &str,
        id: &str,
        hold: Duration,
        wait: Duration,
    ) -> Option<u64> {
        let key = lease_key(account, id);
        let shard = &self.shards[(key % LOCK_SHARDS as u64) as usize];
        let deadline = Instant::now() + wait.min(self.max_wait);

        let mut leases = shard.leases.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let now = Instant::now();
            let busy_until = match leases.get(&key) {
                Some(lease) if lease.expires_at > now => Some(lease.expires_at),
                // Absent or expired: free for the taking.
                _ => None,
            };

            match busy_until {
                None => {
                    let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
                    leases.insert(
                        key,
                        Lease {
                            token,
                            expires_at: now + hold,
                        },
                    );
                    return Some(token);
                }
                Some(until) => {
                    if now >= deadline {
                        return None;
                    }
                    let sleep = until.min(deadline).saturating_duration_since(now);
                    let (guard, _timeout) = shard
                        .freed
                        .wait_timeout(leases, sleep)
                        .unwrap_or_else(|p| p.into_inner());
                    leases = guard;
                }
            }
        }
    }

    /// Release the lease if `token` still holds it. Returns whether a lease
    /// was released; a stale token (expired and re-acquired) releases nothing.
    pub fn release(&self, account: &str, id: &str, token: u64) -> bool {
        let key = lease_key(account, id);
        let shard = &self.shards[(key % LOCK_SHARDS as u64) as usize];

        let mut leases = shard.leases.lock().unwrap_or_else(|p| p.into_inner());
        match leases.get(&key) {
            Some(lease) if lease.token == token => {
                leases.remove(&key);
                shard.freed.notify_all();
                true
            }
            _ => false,
        }
    }
}

impl Default for LeaseLocks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT)
    }
}

fn lease_key(account: &str, id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(account.as_bytes());
    hasher.write(&[0]);
    hasher.write(id.as_bytes());
    hasher.finish()
}
