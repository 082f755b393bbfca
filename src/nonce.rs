// ============================================================================
// NONCE STORE + PER-KEY LOCKS
// ============================================================================
//
// Two small pieces of shared state that are NOT authoritative for money:
//
// - TtlStore: single-use authentication challenges and short rate-limit
//   locks, keyed by wallet address, expiring on a fixed window. Stands in
//   for the external TTL key-value store; the interface is the narrow one
//   the rest of the crate consumes (issue / consume-once / lock).
// - KeyedLocks: per-subject mutual exclusion for the few read-many-rows-
//   then-write paths (nonce handling per address, tier changes per target).
//   One lock per key instead of one global section, so unrelated users
//   never queue behind each other.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lifetime of an authentication challenge.
pub const NONCE_TTL: Duration = Duration::from_secs(60);
/// Lifetime of the per-address card-funding lock. Not explicitly released;
/// expiry bounds retries to one attempt per window.
pub const FUND_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Entry {
    value: String,
    deadline: Instant,
}

/// In-process TTL key-value store.
#[derive(Clone, Default)]
pub struct TtlStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl TtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an authentication challenge for `address`.
    ///
    /// If an unexpired challenge already exists it is returned unchanged,
    /// so repeated issue calls inside the window do not rotate the value
    /// out from under an in-flight signer.
    pub fn issue_nonce(&self, address: &str) -> String {
        let key = format!("wallet:{}", address);
        if let Some(entry) = self.get_live(&key) {
            return entry;
        }

        let challenge = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        self.entries.insert(
            key,
            Entry { value: challenge.clone(), deadline: Instant::now() + NONCE_TTL },
        );
        challenge
    }

    /// Consume the challenge for `address`: get and delete in one step.
    /// A second consume (or a replayed signature) finds nothing.
    pub fn consume_nonce(&self, address: &str) -> Option<String> {
        let key = format!("wallet:{}", address);
        let (_, entry) = self.entries.remove(&key)?;
        if entry.deadline <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Set the short card-funding lock for `address`.
    pub fn set_fund_lock(&self, address: &str) {
        let key = format!("wallet:{}:fund", address);
        self.entries.insert(
            key,
            Entry { value: "lock".to_string(), deadline: Instant::now() + FUND_LOCK_TTL },
        );
    }

    /// Check the card-funding lock for `address`.
    pub fn fund_lock_held(&self, address: &str) -> bool {
        let key = format!("wallet:{}:fund", address);
        self.get_live(&key).is_some()
    }

    fn get_live(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.deadline <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }
}

/// Sharded per-key lock table.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, creating it on first use. The guard is
    /// owned so it can be held across await points.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let cell = self
            .locks
            .entry(key.to_string())
            .or_default()
            .clone();
        cell.lock_owned().await
    }
}

// ============================================================================
// TESTS
// ============================================================================
