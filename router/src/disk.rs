//! Disk I/O queue.
//!
//! Persistence never runs on the orchestrator lock. The router hands a
//! boxed job to the queue and moves on; the job owns everything it touches
//! (`Arc`s and cloned values), so it stays valid after the router is gone.

use tokio::runtime::Handle;
use tracing::warn;

pub type DiskJob = Box<dyn FnOnce() + Send + 'static>;

pub trait DiskQueue: Send + Sync {
    /// Runs `job` once, off the orchestration thread.
    fn enqueue(&self, job: DiskJob);
}

/// Runs each job on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct BlockingDiskQueue {
    handle: Handle,
}

impl BlockingDiskQueue {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime we are called from.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl DiskQueue for BlockingDiskQueue {
    fn enqueue(&self, job: DiskJob) {
        let task = self.handle.spawn_blocking(job);
        self.handle.spawn(async move {
            if let Err(err) = task.await {
                warn!(%err, "disk job panicked");
            }
        });
    }
}
