//! Handle to control and join a background worker task.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owned by the supervisor; dropping it without `shutdown` detaches the task.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { shutdown, join }
    }

    /// Request graceful shutdown and wait for the worker to finish its
    /// in-flight unit of work.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
