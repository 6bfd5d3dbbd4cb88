use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Offload pool is saturated ({0} jobs in flight)")]
    Saturated(usize),
    #[error("Offloaded job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Admission-bounded access to the blocking thread pool.
///
/// Frame work is rejected once `capacity` jobs are in flight so a flood of
/// frames cannot starve control messages or other sessions.
#[derive(Clone)]
pub struct Offload {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Offload {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Starts `work` on the blocking pool, or fails immediately when full.
    pub fn try_submit<F, T>(&self, work: F) -> Result<JoinHandle<T>, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| OffloadError::Saturated(self.in_flight()))?;

        Ok(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        }))
    }

    /// Runs `work` on the blocking pool outside the frame budget.
    pub async fn run<F, T>(&self, work: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(tokio::task::spawn_blocking(work).await?)
    }
}
