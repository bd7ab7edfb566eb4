//! Per-entity exclusive locks.
//!
//! One async mutex per entity key, created on demand. Guards are owned so
//! they can be held across await points and are released on drop, on every
//! exit path of the command that took them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use super::error::CommandError;

/// Entries are pruned once the map grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

/// Registry of entity locks keyed by job id
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock on one entity; released when dropped
pub struct EntityLock {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl EntityLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting at most `timeout`
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<EntityLock, CommandError> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                // Only the map holds a reference: nobody waits on or holds it
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(EntityLock {
                key: key.to_string(),
                _guard: guard,
            }),
            Err(_) => Err(CommandError::LockTimeout {
                key: key.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
