//! Run lifecycle
//!
//! `NotStarted -> Starting -> Running -> Draining -> Stopping -> Stopped`.
//! Stopped is terminal: a new video needs a new manager.

use crate::channel::{EnqueueError, TaskChannel};
use crate::collector::{Collection, PipelineRun, ResultCollector};
use crate::worker::{WorkerPool, WorkerSettings, WorkerSummary};
use segmentfx_core::{
    Batch, BatchResult, Error, EventSink, PipelineEvent, Result, SegmentFxConfig, Task,
    TimeoutConfig, WorkerStatus,
};
use segmentfx_eye::ModelLoader;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);
/// How long a cancelled worker gets to notice before it is declared dead
const CANCEL_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Draining,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl LifecycleState {
    fn can_move_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Draining)
                | (Running, Stopping)
                | (Draining, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Outcome of pushing batches onto the task channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub dispatched: Vec<usize>,
    /// Batches never enqueued because no worker took a task for a whole stall
    /// budget
    pub undispatched: Vec<usize>,
}

/// Watches a full task channel for workers taking tasks off it.
struct Backpressure {
    budget: Duration,
    taken: usize,
    since: Instant,
}

impl Backpressure {
    fn new(tasks: &TaskChannel, budget: Duration) -> Self {
        Self {
            budget,
            taken: Self::taken(tasks),
            since: Instant::now(),
        }
    }

    fn taken(tasks: &TaskChannel) -> usize {
        tasks.batches_dequeued() + tasks.sentinels_dequeued()
    }

    fn reset(&mut self, tasks: &TaskChannel) {
        self.taken = Self::taken(tasks);
        self.since = Instant::now();
    }

    /// False once no task has left the channel for the whole budget.
    fn progressing(&mut self, tasks: &TaskChannel) -> bool {
        let taken = Self::taken(tasks);
        if taken != self.taken {
            self.taken = taken;
            self.since = Instant::now();
        }
        self.since.elapsed() < self.budget
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    worker_count: usize,
    settings: WorkerSettings,
    timeouts: TimeoutConfig,
    tasks: TaskChannel,
    pool: Option<WorkerPool>,
    events: Arc<dyn EventSink>,
}

impl LifecycleManager {
    pub fn new(config: &SegmentFxConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: LifecycleState::NotStarted,
            worker_count: config.pipeline.worker_count,
            settings: WorkerSettings {
                params: crate::worker::SegmentParams {
                    object_count: config.pipeline.object_count,
                    resize_factor: config.pipeline.resize_factor,
                },
                dequeue_timeout: config.timeouts.dequeue,
            },
            timeouts: config.timeouts.clone(),
            tasks: TaskChannel::bounded(config.task_capacity()),
            pool: None,
            events,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn tasks(&self) -> &TaskChannel {
        &self.tasks
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    pub fn live_workers(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.live_count())
    }

    fn transition(&mut self, next: LifecycleState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(Error::InvalidState {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }

    fn require(&self, allowed: &[LifecycleState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                from: self.state.to_string(),
                to: action.to_string(),
            })
        }
    }

    /// Spawns the pool and waits for the workers' models to load. Returns the
    /// number of live workers. With none alive the run is stopped and
    /// `Error::NoWorkers` returned.
    pub fn start(&mut self, loader: Arc<dyn ModelLoader>) -> Result<usize> {
        self.transition(LifecycleState::Starting)?;

        let pool = match WorkerPool::spawn(
            self.worker_count,
            loader,
            &self.tasks,
            self.settings.clone(),
            self.timeouts.startup,
            self.events.as_ref(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                self.transition(LifecycleState::Stopping)?;
                self.transition(LifecycleState::Stopped)?;
                return Err(e);
            }
        };
        let live = pool.live_count();
        self.pool = Some(pool);

        if live == 0 {
            error!(requested = self.worker_count, "no worker started");
            self.stop()?;
            return Err(Error::NoWorkers);
        }
        if live < self.worker_count {
            warn!(
                requested = self.worker_count,
                live, "continuing with a reduced worker pool"
            );
        }

        self.transition(LifecycleState::Running)?;
        info!(workers = live, "pipeline running");
        Ok(live)
    }

    /// Enqueues `batches` in order. A full channel is waited on for as long
    /// as workers keep taking tasks off it. Once no task has been taken for
    /// the stall budget, or no worker is alive, dispatch stops and the
    /// remaining batches are reported as undispatched.
    pub fn dispatch(&mut self, batches: Vec<Batch>) -> Result<Dispatch> {
        self.require(&[LifecycleState::Running], "dispatch")?;

        let mut outcome = Dispatch::default();
        let mut batches = batches.into_iter();
        let mut stall = Backpressure::new(&self.tasks, self.timeouts.stall_budget());

        while let Some(batch) = batches.next() {
            let (id, frames) = (batch.id, batch.len());
            if self.push(Task::Batch(batch), &mut stall)? {
                outcome.dispatched.push(id);
                self.events
                    .emit(&PipelineEvent::BatchDispatched { batch_id: id, frames });
            } else {
                outcome.undispatched.push(id);
                outcome.undispatched.extend(batches.by_ref().map(|b| b.id));
                error!(
                    undispatched = outcome.undispatched.len(),
                    budget = ?stall.budget,
                    "dispatch abandoned, workers are not consuming"
                );
            }
        }
        Ok(outcome)
    }

    /// Enqueues one sentinel per live worker, waiting on a full channel the
    /// same way dispatch does. Live workers are marked terminating. Returns
    /// how many sentinels were sent.
    pub fn drain(&mut self) -> Result<usize> {
        self.transition(LifecycleState::Draining)?;
        let live = self.live_workers();
        let mut stall = Backpressure::new(&self.tasks, self.timeouts.stall_budget());

        let mut sent = 0;
        while sent < live {
            sent += self
                .tasks
                .enqueue_sentinels(live - sent, self.timeouts.enqueue)?;
            if sent < live && (self.live_workers() == 0 || !stall.progressing(&self.tasks)) {
                // workers that never take theirs are forced down at stop
                warn!(sent, live, "workers stopped taking tasks, sentinels withheld");
                break;
            }
        }
        if let Some(pool) = &self.pool {
            pool.mark_terminating();
        }
        debug!(sentinels = sent, "sentinels enqueued");
        Ok(sent)
    }

    /// Pushes one task, retrying while the channel is full and workers make
    /// progress. Returns false when it gave up.
    fn push(&self, mut task: Task, stall: &mut Backpressure) -> Result<bool> {
        loop {
            match self.tasks.enqueue(task, self.timeouts.enqueue) {
                Ok(()) => {
                    stall.reset(&self.tasks);
                    return Ok(true);
                }
                Err(EnqueueError::Full(returned)) => {
                    if self.live_workers() == 0 || !stall.progressing(&self.tasks) {
                        return Ok(false);
                    }
                    debug!("task channel full, waiting for workers");
                    task = returned;
                }
                Err(err @ EnqueueError::Closed(_)) => return Err(err.into()),
            }
        }
    }

    pub fn collect(
        &mut self,
        expected_ids: &[usize],
        run: &mut PipelineRun,
    ) -> Result<Collection<BatchResult>> {
        self.require(
            &[LifecycleState::Running, LifecycleState::Draining],
            "collect",
        )?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::InvalidState {
                from: self.state.to_string(),
                to: "collect".to_string(),
            })?;
        let collector = ResultCollector::from_config(&self.timeouts);
        Ok(collector.collect(pool.results(), expected_ids, run, self.events.as_ref()))
    }

    /// Joins every worker within the join window. Workers still running after
    /// it are cancelled and detached.
    pub fn stop(&mut self) -> Result<Vec<WorkerSummary>> {
        self.transition(LifecycleState::Stopping)?;

        let leftover = self.tasks.drain_pending();
        if !leftover.is_empty() {
            warn!(batches = ?leftover, "discarding batches no worker picked up");
        }

        let summaries = self.join_workers();
        self.transition(LifecycleState::Stopped)?;
        info!(joined = summaries.len(), "pipeline stopped");
        Ok(summaries)
    }

    fn join_workers(&mut self) -> Vec<WorkerSummary> {
        let Some(pool) = self.pool.as_mut() else {
            return Vec::new();
        };
        let events = self.events.clone();
        let deadline = Instant::now() + self.timeouts.join;
        let mut summaries = Vec::new();

        for worker in pool.workers_mut() {
            let Some(thread) = worker.take_thread() else {
                continue;
            };
            worker.mark_terminating();
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }

            let forced = !thread.is_finished();
            if forced {
                warn!(worker = worker.id, "worker did not stop within the join window");
                worker.cancel();
                let grace = Instant::now() + CANCEL_GRACE;
                while !thread.is_finished() && Instant::now() < grace {
                    thread::sleep(JOIN_POLL);
                }
            }

            if thread.is_finished() {
                match thread.join() {
                    Ok(summary) => summaries.push(summary),
                    Err(_) => {
                        error!(worker = worker.id, "worker thread panicked");
                        worker.set_status(WorkerStatus::Dead);
                    }
                }
                if worker.status().is_alive() {
                    worker.set_status(WorkerStatus::Terminated);
                }
            } else {
                // still inside a model call; the thread is detached
                worker.set_status(WorkerStatus::Dead);
            }

            events.emit(&PipelineEvent::WorkerTerminated {
                worker_id: worker.id,
                forced,
            });
        }
        summaries
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            if self.state != LifecycleState::Stopped {
                pool.cancel_all();
            }
        }
    }
}
