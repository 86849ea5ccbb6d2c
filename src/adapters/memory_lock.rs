use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::ports::{LockStore, RepositoryResult};

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RepositoryResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> RepositoryResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries();
        let owned = match entries.get(key) {
            Some((held, expires_at)) => held == token && *expires_at > now,
            None => false,
        };
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}
