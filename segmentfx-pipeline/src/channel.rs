//! Bounded task channel shared by the coordinator and the workers

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use segmentfx_core::{Error, Result, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Enqueue failure. The task is handed back so the caller can retry it.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Task),
    Closed(Task),
}

impl EnqueueError {
    pub fn into_task(self) -> Task {
        match self {
            EnqueueError::Full(task) | EnqueueError::Closed(task) => task,
        }
    }
}

impl From<EnqueueError> for Error {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Full(_) => Error::ChannelTimeout("task channel full".to_string()),
            EnqueueError::Closed(_) => Error::ChannelClosed("task channel".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches_enqueued: AtomicUsize,
    sentinels_enqueued: AtomicUsize,
    batches_dequeued: AtomicUsize,
    sentinels_dequeued: AtomicUsize,
}

/// FIFO of batches and termination sentinels. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct TaskChannel {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl TaskChannel {
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Capacity of two queued tasks per worker.
    pub fn for_workers(workers: usize) -> Self {
        Self::bounded(workers.saturating_mul(2))
    }

    /// Blocks while the channel is full, for at most `timeout`.
    pub fn enqueue(&self, task: Task, timeout: Duration) -> std::result::Result<(), EnqueueError> {
        let sentinel = task.is_sentinel();
        match self.sender.send_timeout(task, timeout) {
            Ok(()) => {
                let counter = if sentinel {
                    &self.counters.sentinels_enqueued
                } else {
                    &self.counters.batches_enqueued
                };
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(task)) => Err(EnqueueError::Full(task)),
            Err(SendTimeoutError::Disconnected(task)) => Err(EnqueueError::Closed(task)),
        }
    }

    /// Waits up to `timeout` for the next task.
    pub fn dequeue(&self, timeout: Duration) -> Result<Task> {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                let counter = if task.is_sentinel() {
                    &self.counters.sentinels_dequeued
                } else {
                    &self.counters.batches_dequeued
                };
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(task)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::ChannelTimeout(format!(
                "no task within {:?}",
                timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ChannelClosed("task channel".to_string()))
            }
        }
    }

    /// Enqueues up to `count` sentinels, one per worker that should stop.
    /// Stops at the first attempt that finds the channel full for `timeout`
    /// and returns how many went in; the caller retries the rest.
    pub fn enqueue_sentinels(&self, count: usize, timeout: Duration) -> Result<usize> {
        for sent in 0..count {
            match self.enqueue(Task::Sentinel, timeout) {
                Ok(()) => {}
                Err(EnqueueError::Full(_)) => {
                    debug!(sent, count, "channel full, sentinel enqueue paused");
                    return Ok(sent);
                }
                Err(err @ EnqueueError::Closed(_)) => return Err(err.into()),
            }
        }
        Ok(count)
    }

    /// Removes queued batches so no worker picks them up. Queued sentinels stay
    /// in the channel. Returns the ids of the removed batches.
    pub fn drain_pending(&self) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut sentinels = 0;
        while let Ok(task) = self.receiver.try_recv() {
            match task {
                Task::Batch(batch) => ids.push(batch.id),
                Task::Sentinel => sentinels += 1,
            }
        }
        for _ in 0..sentinels {
            if self.sender.try_send(Task::Sentinel).is_err() {
                warn!("could not requeue sentinel");
            }
        }
        ids
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn batches_enqueued(&self) -> usize {
        self.counters.batches_enqueued.load(Ordering::SeqCst)
    }

    pub fn sentinels_enqueued(&self) -> usize {
        self.counters.sentinels_enqueued.load(Ordering::SeqCst)
    }

    pub fn batches_dequeued(&self) -> usize {
        self.counters.batches_dequeued.load(Ordering::SeqCst)
    }

    pub fn sentinels_dequeued(&self) -> usize {
        self.counters.sentinels_dequeued.load(Ordering::SeqCst)
    }
}
