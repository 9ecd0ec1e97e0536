//! Graceful shutdown for the daemon's tasks.
//!
//! Two phases: broadcast a stop signal, then wait (bounded by the grace
//! period) until every registered task has reported completion. Tasks
//! report by dropping their [`ShutdownHandle`], so one that ends early
//! (a client that disconnected) is already accounted for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown grace period of {0:?} elapsed with {1} task(s) still running")]
    Timeout(Duration, usize),

    #[error("Shutdown already in progress")]
    AlreadyInProgress,
}

/// Held by one task for as long as it runs.
#[derive(Debug)]
pub struct ShutdownHandle {
    receiver: broadcast::Receiver<()>,
    completion: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<String, String>>>,
    id: String,
}

impl ShutdownHandle {
    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&mut self) {
        // a closed or lagged channel also means the manager is done with us
        let _ = self.receiver.recv().await;
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
        self.completion.add_permits(1);
    }
}

/// Owner of the stop signal.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    completion: Arc<Semaphore>,
    registered: Mutex<usize>,
    running: Arc<Mutex<HashMap<String, String>>>,
    in_progress: Mutex<bool>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            completion: Arc::new(Semaphore::new(0)),
            registered: Mutex::new(0),
            running: Arc::new(Mutex::new(HashMap::new())),
            in_progress: Mutex::new(false),
            grace,
        }
    }

    /// Register a task. `name` is only used for reporting stragglers.
    pub fn register(&self, name: &str) -> ShutdownHandle {
        *self.registered.lock() += 1;
        let id = Uuid::new_v4().to_string();
        self.running.lock().insert(id.clone(), name.to_string());
        debug!(task = %name, id = %id, "Registered for shutdown");

        ShutdownHandle {
            receiver: self.shutdown_tx.subscribe(),
            completion: self.completion.clone(),
            running: self.running.clone(),
            id,
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.in_progress.lock()
    }

    /// Tasks registered and not yet finished.
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }

    /// Signal every task and wait for them within the grace period.
    pub async fn request_shutdown(&self) -> Result<(), ShutdownError> {
        {
            let mut in_progress = self.in_progress.lock();
            if *in_progress {
                return Err(ShutdownError::AlreadyInProgress);
            }
            *in_progress = true;
        }

        let registered = *self.registered.lock();
        info!(tasks = self.running(), "Signaling shutdown");
        // no receivers left is fine: everything already finished
        let _ = self.shutdown_tx.send(());

        let permits = u32::try_from(registered).unwrap_or(u32::MAX);
        match timeout(self.grace, self.completion.acquire_many(permits)).await {
            Ok(Ok(acquired)) => {
                acquired.forget();
                info!("All tasks finished");
                Ok(())
            }
            // the semaphore is never closed
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                let running = self.running.lock();
                for (id, name) in running.iter() {
                    warn!(task = %name, id = %id, "Task did not finish within grace period");
                }
                Err(ShutdownError::Timeout(self.grace, running.len()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(5)));

        for delay in [100u64, 200, 300] {
            let mut handle = manager.register("worker");
            tokio::spawn(async move {
                handle.wait_for_shutdown().await;
                sleep(Duration::from_millis(delay)).await;
                drop(handle);
            });
        }
        assert_eq!(manager.running(), 3);

        manager.request_shutdown().await.unwrap();
        assert_eq!(manager.running(), 0);
        assert!(manager.is_requested());
    }

    #[tokio::test]
    async fn test_finished_tasks_count_as_complete() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        drop(manager.register("short-lived"));
        drop(manager.register("short-lived"));
        manager.request_shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        let handle = manager.register("stuck");

        let err = manager.request_shutdown().await.unwrap_err();
        assert!(matches!(err, ShutdownError::Timeout(_, 1)));
        drop(handle);
    }

    #[tokio::test]
    async fn test_second_request_rejected() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager.request_shutdown().await.unwrap();
        assert!(matches!(
            manager.request_shutdown().await,
            Err(ShutdownError::AlreadyInProgress)
        ));
    }
}
