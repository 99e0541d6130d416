//! Short-TTL named lock primitive (spec.md §4.13, C13).
//!
//! A coarse mutual-exclusion primitive for callers that need a critical
//! section wider than one row update — not used by the outbox or process
//! runner themselves, which rely on row-level `FOR UPDATE SKIP LOCKED`
//! claims instead (see `ddd-db`'s claim functions, the same
//! claim-then-release idiom this crate's [`LockStore::try_acquire`] /
//! [`LockStore::release`] pair follows).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Why a lock could not be acquired or released. Maps to the "Locking" kind
/// in the error taxonomy (spec.md §7): callers decide whether to retry.
#[derive(Debug)]
pub enum LockError {
    /// All retries were exhausted without acquiring the lock.
    Timeout { prefix: String, name: String, retries: u32 },
    /// The backing store failed (cache/database unavailable).
    Backend(anyhow::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { prefix, name, retries } => write!(
                f,
                "could not acquire lock '{prefix}:{name}' after {retries} retries"
            ),
            Self::Backend(e) => write!(f, "lock backend error: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => e.source(),
            Self::Timeout { .. } => None,
        }
    }
}

/// The add-if-absent primitive a lock store must provide.
///
/// Implementations keyed as `"{prefix}:{name}"`. `try_acquire` is expected to
/// behave atomically: it must not grant the lock if an unexpired holder
/// already exists, and it must clear an expired holder before deciding.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to set `prefix:name` if absent or expired. Returns `true` if
    /// this call became the holder.
    async fn try_acquire(&self, prefix: &str, name: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Release `prefix:name`, if held. Releasing a lock nobody holds is a no-op.
    async fn release(&self, prefix: &str, name: &str) -> anyhow::Result<()>;
}

/// In-process, single-host lock store. Cluster-safe only insofar as the
/// process is the whole cluster; a distributed deployment should back
/// [`LockStore`] with a shared cache (e.g. Redis `SET NX PX`) or the
/// database fallback described in spec.md §4.13 instead.
#[derive(Default)]
pub struct InMemoryLockStore {
    held: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(prefix: &str, name: &str) -> String {
        format!("{prefix}:{name}")
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, prefix: &str, name: &str, ttl: Duration) -> anyhow::Result<bool> {
        let key = Self::key(prefix, name);
        let now = Utc::now();
        let mut held = self.held.lock().unwrap();
        if let Some(expires_at) = held.get(&key) {
            if *expires_at > now {
                return Ok(false);
            }
            // Expired holder: clear it proactively before deciding, per spec.md §4.13.
        }
        held.insert(key, now + chrono::Duration::from_std(ttl)?);
        Ok(true)
    }

    async fn release(&self, prefix: &str, name: &str) -> anyhow::Result<()> {
        let key = Self::key(prefix, name);
        self.held.lock().unwrap().remove(&key);
        Ok(())
    }
}

/// Acquire/retry policy. Defaults mirror spec.md §6 ("lock: duration,
/// retries, retry_interval_ms — defaults 30s / 10 / 1000ms").
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub duration: Duration,
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            retries: 10,
            retry_interval: Duration::from_millis(1000),
        }
    }
}

impl LockPolicy {
    /// Validate against spec.md §4.13's bounds: `duration∈[1,60]s`, `retries≤20`, `retry_interval≥125ms`.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.duration >= Duration::from_secs(1) && self.duration <= Duration::from_secs(60),
            "lock duration must be within [1, 60] seconds"
        );
        anyhow::ensure!(self.retries <= 20, "lock retries must be <= 20");
        anyhow::ensure!(
            self.retry_interval >= Duration::from_millis(125),
            "lock retry_interval must be >= 125ms"
        );
        Ok(())
    }
}

/// Acquire `prefix:name`, retrying on contention up to `policy.retries` times.
pub async fn acquire(
    store: &dyn LockStore,
    prefix: &str,
    name: &str,
    policy: LockPolicy,
) -> Result<(), LockError> {
    policy.validate().map_err(LockError::Backend)?;
    for attempt in 0..=policy.retries {
        let acquired = store
            .try_acquire(prefix, name, policy.duration)
            .await
            .map_err(LockError::Backend)?;
        if acquired {
            return Ok(());
        }
        if attempt < policy.retries {
            tokio::time::sleep(policy.retry_interval).await;
        }
    }
    Err(LockError::Timeout {
        prefix: prefix.to_string(),
        name: name.to_string(),
        retries: policy.retries,
    })
}

pub async fn release(store: &dyn LockStore, prefix: &str, name: &str) -> anyhow::Result<()> {
    store.release(prefix, name).await
}

/// Run `f` while holding `prefix:name`, releasing on every exit path
/// (success, error, or panic unwinding through the caller).
pub async fn with_lock<F, Fut, T>(
    store: &dyn LockStore,
    prefix: &str,
    name: &str,
    policy: LockPolicy,
    f: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    acquire(store, prefix, name, policy).await?;
    let result = f().await;
    release(store, prefix, name)
        .await
        .map_err(LockError::Backend)?;
    result.map_err(LockError::Backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_rejected_until_released() {
        let store = InMemoryLockStore::new();
        assert!(store.try_acquire("p", "n", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_acquire("p", "n", Duration::from_secs(5)).await.unwrap());
        store.release("p", "n").await.unwrap();
        assert!(store.try_acquire("p", "n", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_holder_is_cleared_on_next_attempt() {
        let store = InMemoryLockStore::new();
        assert!(store
            .try_acquire("p", "n", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.try_acquire("p", "n", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_retries_then_succeeds_once_released() {
        let store = InMemoryLockStore::new();
        store.try_acquire("p", "n", Duration::from_millis(50)).await.unwrap();
        let policy = LockPolicy {
            duration: Duration::from_secs(1),
            retries: 5,
            retry_interval: Duration::from_millis(125),
        };
        acquire(&store, "p", "n", policy).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_when_never_released() {
        let store = InMemoryLockStore::new();
        store.try_acquire("p", "n", Duration::from_secs(60)).await.unwrap();
        let policy = LockPolicy {
            duration: Duration::from_secs(1),
            retries: 2,
            retry_interval: Duration::from_millis(125),
        };
        let err = acquire(&store, "p", "n", policy).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let store = InMemoryLockStore::new();
        let policy = LockPolicy::default();
        let result: Result<(), LockError> =
            with_lock(&store, "p", "n", policy, || async { anyhow::bail!("boom") }).await;
        assert!(result.is_err());
        assert!(store.try_acquire("p", "n", Duration::from_secs(5)).await.unwrap());
    }

    #[test]
    fn policy_rejects_out_of_range_values() {
        let bad = LockPolicy {
            duration: Duration::from_secs(0),
            ..LockPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
