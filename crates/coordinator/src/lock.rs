//! Non-reentrant async lock guarding the persisted job list.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Single-permit lock. Waiters are served in arrival order.
///
/// Holding is represented by a [`WriteGuard`]; the lock is released when the
/// guard is dropped or [`WriteGuard::release`] is called, so every exit path
/// releases and a caller can never release a lock it does not hold.
#[derive(Clone)]
pub struct WriteLock {
    permits: Arc<Semaphore>,
}

pub struct WriteGuard {
    _permit: OwnedSemaphorePermit,
}

impl WriteLock {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the lock if it is free. Never blocks.
    pub fn try_acquire(&self) -> Option<WriteGuard> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| WriteGuard { _permit: permit })
    }

    /// Wait until the lock is free, then take it.
    pub async fn acquire(&self) -> WriteGuard {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("write lock semaphore is never closed");
        WriteGuard { _permit: permit }
    }

    pub fn is_locked(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for WriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteGuard {
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_on_held_lock() {
        let lock = WriteLock::new();
        let guard = lock.try_acquire().expect("free lock");
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        guard.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_exclusive() {
        let lock = WriteLock::new();
        let held = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let held = Arc::clone(&held);
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _guard = lock.acquire().await;
                    assert!(!held.swap(true, Ordering::SeqCst), "two holders at once");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    held.store(false, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!lock.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let lock = WriteLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let guard = lock.acquire().await;

        let mut tasks = Vec::new();
        for n in 0..3 {
            let lock = lock.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                order.lock().unwrap().push(n);
            }));
            // let the waiter queue up before spawning the next one
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        guard.release();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_guard_released_on_error_path() {
        let lock = WriteLock::new();
        let result: Result<(), &str> = async {
            let _guard = lock.acquire().await;
            Err("write failed")
        }
        .await;
        assert!(result.is_err());
        assert!(!lock.is_locked());
    }
}
