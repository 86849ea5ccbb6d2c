//! Mutual exclusion over named resources held in a shared store.
//!
//! Keys follow `lock:<domain>:<resource-id>[:<sub-resource>]`; each
//! acquisition writes a fresh random token so a holder can only ever
//! release its own lock.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::ports::{LockStore, RepositoryError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out acquiring {key} after {attempts} retries")]
    Timeout { key: String, attempts: u32 },

    #[error("Lock store error: {0}")]
    Store(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Extra tries after the first one fails.
    pub retries: u32,
    /// Delay before the first retry; doubled for each following one.
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Proof of ownership handed out by `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

pub fn lock_key(domain: &str, parts: &[&str]) -> String {
    let mut key = format!("lock:{}", domain);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    defaults: LockOptions,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, defaults: LockOptions) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    /// Returns `None` once every retry found the key taken. Never blocks
    /// longer than the sum of the backoff delays.
    pub async fn acquire(
        &self,
        key: &str,
        options: LockOptions,
    ) -> Result<Option<LockToken>, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut delay = options.retry_delay;

        for attempt in 0..=options.retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }

            if self.store.set_if_absent(key, &token, options.ttl).await? {
                tracing::debug!(key = %key, attempt, "Lock acquired");
                return Ok(Some(LockToken {
                    key: key.to_string(),
                    token,
                }));
            }
        }

        tracing::warn!(key = %key, retries = options.retries, "Lock still held after retries");
        Ok(None)
    }

    /// Compare-and-delete. False if the lock expired or someone else holds it now.
    pub async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let released = self.store.compare_and_delete(&token.key, &token.token).await?;
        if !released {
            tracing::warn!(key = %token.key, "Lock was no longer ours at release");
        }
        Ok(released)
    }

    pub async fn with_lock<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.with_lock_opts(key, self.defaults, f).await
    }

    /// Runs `f` while holding `key`. The lock is released on success, error
    /// and panic alike; the inner result or panic is passed through unchanged.
    pub async fn with_lock_opts<F, Fut, T, E>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let token = self
            .acquire(key, options)
            .await?
            .ok_or_else(|| LockError::Timeout {
                key: key.to_string(),
                attempts: options.retries,
            })?;

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.release(&token).await {
            tracing::error!(key = %key, "Failed to release lock: {}", e);
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
