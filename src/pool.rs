//! Bounded worker pool
//!
//! Each protocol listener owns one pool. Submitting waits for a free slot, so a
//! saturated pool throttles the accept loop that feeds it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

use crate::error::PoolClosed;

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    slots: Arc<Semaphore>,
    outstanding: AtomicUsize,
    drained: Notify,
}

/// Releases the outstanding counter even when the task panics.
struct Outstanding(Arc<PoolInner>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                outstanding: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Submitted tasks that have not finished yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Schedule `task`, waiting while `capacity` tasks are already running.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Counted while waiting for a slot, so `release` also waits for blocked submitters.
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = Outstanding(self.inner.clone());

        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await;
        });

        Ok(())
    }

    /// Stop accepting work and wait for in-flight tasks to finish.
    pub async fn release(&self) {
        self.inner.slots.close();
        loop {
            let drained = self.inner.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            drained.await;
        }
    }
}
