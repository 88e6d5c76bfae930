use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;

use crate::store::ClaimsStore;
use crate::ClaimsError;

/// Upper bound for the delay between two lock attempts.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Serializes mutating operations on one claim key across every process sharing the store.
///
/// Locks live in the store, never in process memory, so two managers in different processes
/// exclude each other exactly like two managers in the same process. Each coordinator owns a
/// random holder token and only ever releases locks taken under it.
pub struct LockCoordinator {
    store: Arc<dyn ClaimsStore>,
    holder: String,
    timeout: Duration,
    retry_interval: Duration,
}

impl LockCoordinator {
    /// Creates a coordinator with a fresh holder token.
    #[must_use]
    pub fn new(store: Arc<dyn ClaimsStore>, timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            store,
            holder: hex::encode(rand::random::<[u8; 16]>()),
            timeout,
            retry_interval,
        }
    }

    /// Token identifying this coordinator's locks in the store.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Takes the lock on `key`, retrying with capped exponential backoff.
    ///
    /// # Errors
    /// - `ClaimsError::LockContention` if the lock is still held by someone else after the
    ///   configured timeout
    /// - `ClaimsError::Adapter` if the store fails
    pub async fn acquire(&self, key: &str) -> Result<(), ClaimsError> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self
                .store
                .acquire_lock(key.to_string(), self.holder.clone())
                .await?
            {
                crate::debug!(
                    "lock.acquired key={} holder={} attempts={} timestamp={}",
                    key,
                    self.holder,
                    attempts,
                    Utc::now().to_rfc3339()
                );
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                crate::warn!(
                    "lock.contention key={} holder={} attempts={} waited_ms={} timestamp={}",
                    key,
                    self.holder,
                    attempts,
                    waited_ms,
                    Utc::now().to_rfc3339()
                );
                return Err(ClaimsError::LockContention {
                    key: key.to_string(),
                    waited_ms,
                });
            }

            let delay = backoff_delay(self.retry_interval, attempts).min(self.timeout - waited);
            tokio::time::sleep(delay).await;
        }
    }

    /// Releases this coordinator's lock on `key`.
    ///
    /// # Errors
    /// - `ClaimsError::Adapter` if the store fails
    pub async fn release(&self, key: &str) -> Result<(), ClaimsError> {
        self.store
            .release_lock(key.to_string(), Some(self.holder.clone()))
            .await?;
        crate::debug!(
            "lock.released key={} holder={} timestamp={}",
            key,
            self.holder,
            Utc::now().to_rfc3339()
        );
        Ok(())
    }

    /// Releases the lock on `key` whoever holds it. Administrative use only, e.g. after a
    /// process died mid-migration.
    ///
    /// # Errors
    /// - `ClaimsError::Adapter` if the store fails
    pub async fn force_release(&self, key: &str) -> Result<(), ClaimsError> {
        self.store.release_lock(key.to_string(), None).await?;
        crate::warn!(
            "lock.force_released key={} timestamp={}",
            key,
            Utc::now().to_rfc3339()
        );
        Ok(())
    }

    /// Runs `critical_section` while holding the lock on `key`.
    ///
    /// The lock is released on every exit path, including panics and a caller dropping the
    /// returned future. A panic is resumed once the lock is released. A dropped future releases
    /// from a task spawned on the current runtime. If releasing fails after a failed critical
    /// section, the release error is logged and the original error is returned.
    ///
    /// # Errors
    /// - whatever [`acquire`](Self::acquire) or `critical_section` returns
    /// - `ClaimsError::Adapter` if releasing fails after a successful critical section
    pub async fn with_lock<T, F, Fut>(&self, key: &str, critical_section: F) -> Result<T, ClaimsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClaimsError>>,
    {
        self.acquire(key).await?;
        let mut held = HeldLock {
            store: Arc::clone(&self.store),
            key: key.to_string(),
            holder: self.holder.clone(),
            released: false,
        };

        let outcome = AssertUnwindSafe(async { critical_section().await })
            .catch_unwind()
            .await;
        let released = self.release(key).await;
        held.released = true;

        match outcome {
            Ok(Ok(value)) => {
                released?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(release_error) = released {
                    crate::error!(
                        "lock.release_failed key={} error={} original_error={} timestamp={}",
                        key,
                        release_error,
                        e,
                        Utc::now().to_rfc3339()
                    );
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(release_error) = released {
                    crate::error!(
                        "lock.release_failed key={} error={} after=panic timestamp={}",
                        key,
                        release_error,
                        Utc::now().to_rfc3339()
                    );
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// A lock taken by [`LockCoordinator::with_lock`], released in the background if the owning
/// future is dropped before it releases the lock itself.
struct HeldLock {
    store: Arc<dyn ClaimsStore>,
    key: String,
    holder: String,
    released: bool,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            crate::error!(
                "lock.leaked key={} holder={} reason=no_runtime timestamp={}",
                key,
                holder,
                Utc::now().to_rfc3339()
            );
            return;
        };

        crate::warn!(
            "lock.release_on_drop key={} holder={} timestamp={}",
            key,
            holder,
            Utc::now().to_rfc3339()
        );
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            if let Err(e) = store.release_lock(key.clone(), Some(holder)).await {
                crate::error!(
                    "lock.release_failed key={} error={} after=drop timestamp={}",
                    key,
                    e,
                    Utc::now().to_rfc3339()
                );
            }
        });
    }
}

/// `base * 2^(attempt - 1)`, capped at [`MAX_RETRY_INTERVAL`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let factor = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_INTERVAL)
}
