use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Serializes engine operations. Waiters are granted the lock strictly in
/// arrival order; a released guard hands ownership directly to the next
/// waiter instead of clearing the lock.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
}

pub struct OperationGuard<'a> {
    manager: &'a LockManager,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

/// A queued acquire. If it is dropped after the lock was handed to it but
/// before it was observed, the lock is passed on.
struct PendingAcquire<'a> {
    manager: &'a LockManager,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.manager.release();
            }
        }
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn acquire(&self) -> OperationGuard<'_> {
        loop {
            let rx = {
                let mut state = self.state();
                if !state.locked {
                    state.locked = true;
                    return OperationGuard { manager: self };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingAcquire {
                manager: self,
                rx: Some(rx),
            };
            let granted = match pending.rx.as_mut() {
                Some(rx) => rx.await.is_ok(),
                None => false,
            };
            pending.rx = None;
            if granted {
                return OperationGuard { manager: self };
            }
        }
    }

    fn release(&self) {
        let mut state = self.state();
        while let Some(next) = state.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        state.locked = false;
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.state().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_waiters(manager: &LockManager, count: usize) {
        while manager.waiting() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_waiters_are_granted_in_arrival_order() {
        let manager = Arc::new(LockManager::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = manager.acquire().await;
        let mut tasks = Vec::new();
        for i in 0..4 {
            let waiter = manager.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = waiter.acquire().await;
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
            }));
            wait_for_waiters(&manager, i + 1).await;
        }

        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(!manager.state().locked);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_wedge_lock() {
        let manager = LockManager::new();
        let guard = manager.acquire().await;

        let timed_out = tokio::time::timeout(Duration::from_millis(10), manager.acquire()).await;
        assert!(timed_out.is_err());

        drop(guard);
        let _guard = manager.acquire().await;
        assert_eq!(manager.waiting(), 0);
    }
}
