//! Host-wide named locks serializing writers on the same instance

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use single_instance::SingleInstance;
use tracing::debug;

use crate::error::{ManagerError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of one operation; released on drop
pub struct ScopedLock {
    _guard: SingleInstance,
    key: String,
}

impl ScopedLock {
    /// Acquire the lock for `key` within `store_scope`, waiting up to `timeout`
    pub fn acquire(store_scope: &str, key: &str, timeout: Duration) -> Result<Self> {
        let name = lock_name(store_scope, key);
        let give_up = Instant::now() + timeout;

        loop {
            let guard = SingleInstance::new(&name).map_err(|e| ManagerError::Io {
                path: name.clone().into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
            if guard.is_single() {
                debug!("Acquired lock {}", key);
                return Ok(Self {
                    _guard: guard,
                    key: key.to_string(),
                });
            }
            drop(guard);

            if Instant::now() >= give_up {
                return Err(ManagerError::Busy {
                    scope: key.to_string(),
                });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Lock guarding one instance's record and directory tree
    pub fn instance(store_scope: &str, name: &str, timeout: Duration) -> Result<Self> {
        Self::acquire(store_scope, &instance_key(name), timeout)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.key);
    }
}

fn instance_key(name: &str) -> String {
    format!("instance/{}", name)
}

/// Short, filesystem- and socket-safe lock name
fn lock_name(store_scope: &str, key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    store_scope.hash(&mut hasher);
    key.hash(&mut hasher);
    format!("fim-{:016x}", hasher.finish())
}
