//! Structured pipeline events for front ends and logs

use crate::types::{RunMode, RunOutcome};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: Uuid,
        mode: RunMode,
        frames: usize,
        batches: usize,
        workers: usize,
    },
    WorkerReady {
        worker_id: usize,
    },
    WorkerStartupFailed {
        worker_id: usize,
        reason: String,
    },
    BatchDispatched {
        batch_id: usize,
        frames: usize,
    },
    BatchCompleted {
        batch_id: usize,
        ok: bool,
        received: usize,
        expected: usize,
    },
    ResultTimeout {
        consecutive: u32,
        threshold: u32,
    },
    RunAborted {
        collected: usize,
        expected: usize,
    },
    WorkerTerminated {
        worker_id: usize,
        forced: bool,
    },
    FramesInterpolated {
        from_anchor: usize,
        to_anchor: usize,
        frames: usize,
    },
    RunFinished {
        run_id: Uuid,
        outcome: RunOutcome,
        collected: usize,
        expected: usize,
    },
}

/// Receiver of pipeline events. Must be cheap: it runs on the coordinator thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RunStarted {
                run_id,
                mode,
                frames,
                batches,
                workers,
            } => info!(%run_id, ?mode, frames, batches, workers, "run started"),
            PipelineEvent::WorkerReady { worker_id } => info!(worker = worker_id, "worker ready"),
            PipelineEvent::WorkerStartupFailed { worker_id, reason } => {
                warn!(worker = worker_id, %reason, "worker failed to start")
            }
            PipelineEvent::BatchDispatched { batch_id, frames } => {
                debug!(batch = batch_id, frames, "batch dispatched")
            }
            PipelineEvent::BatchCompleted {
                batch_id,
                ok,
                received,
                expected,
            } => info!(batch = batch_id, ok, "received {}/{} batches", received, expected),
            PipelineEvent::ResultTimeout {
                consecutive,
                threshold,
            } => warn!(consecutive, threshold, "timed out waiting for results"),
            PipelineEvent::RunAborted {
                collected,
                expected,
            } => warn!(collected, expected, "too many consecutive timeouts, run aborted"),
            PipelineEvent::WorkerTerminated { worker_id, forced } => {
                if *forced {
                    warn!(worker = worker_id, "worker did not finish in time, terminated")
                } else {
                    debug!(worker = worker_id, "worker finished")
                }
            }
            PipelineEvent::FramesInterpolated {
                from_anchor,
                to_anchor,
                frames,
            } => debug!(from_anchor, to_anchor, frames, "frames interpolated"),
            PipelineEvent::RunFinished {
                run_id,
                outcome,
                collected,
                expected,
            } => info!(
                %run_id,
                complete = outcome.is_complete(),
                collected,
                expected,
                "run finished"
            ),
        }
    }
}

/// Forwards events to a front end over a channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events.lock().push(event.clone());
    }
}
