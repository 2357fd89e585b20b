//! Worker pool
//!
//! Every worker is a named OS thread that loads its own segmentation model,
//! then pulls batches from the shared [`TaskChannel`] until it receives a
//! sentinel or is cancelled. Failures inside a batch (errors or panics) are
//! reported as a failed `BatchResult` and never stop the worker.

use crate::channel::TaskChannel;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use segmentfx_core::mask::resize_binary;
use segmentfx_core::{
    Batch, BatchResult, Error, EventSink, Frame, FrameResult, FrameStatus, MaskProposal,
    PipelineEvent, Result, Task, WorkerStatus,
};
use segmentfx_eye::{downsample, ModelLoader, SegmentationModel, VisionError};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Per-frame segmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentParams {
    /// Masks kept per frame, largest first
    pub object_count: usize,
    /// Downsample factor applied before inference, in (0, 1]
    pub resize_factor: f32,
}

impl Default for SegmentParams {
    fn default() -> Self {
        Self {
            object_count: 5,
            resize_factor: 1.0,
        }
    }
}

/// Runs automatic segmentation on one frame and maps the retained masks back to
/// the frame's original resolution.
pub fn segment_frame(
    model: &mut dyn SegmentationModel,
    frame: &Frame,
    params: &SegmentParams,
) -> std::result::Result<Vec<MaskProposal>, VisionError> {
    let factor = params.resize_factor;
    let scaled = factor < 1.0;
    let proposals = if scaled {
        model.generate(&downsample(&frame.pixels, factor))?
    } else {
        model.generate(&frame.pixels)?
    };

    let top = MaskProposal::top_by_area(proposals, params.object_count);
    if !scaled {
        return Ok(top);
    }

    Ok(top
        .into_iter()
        .map(|p| MaskProposal {
            segmentation: resize_binary(&p.segmentation, frame.original_size),
            bbox: p.bbox.unscaled(factor),
            area: p.area / (factor * factor),
            stability_score: p.stability_score,
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub params: SegmentParams,
    /// Wait per dequeue attempt. A timeout only means "poll again".
    pub dequeue_timeout: Duration,
}

/// What a worker thread did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub batches_processed: usize,
    pub batches_failed: usize,
    pub sentinels_seen: usize,
}

struct Readiness {
    worker_id: usize,
    outcome: std::result::Result<(), String>,
}

/// Coordinator-side view of one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: usize,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<WorkerSummary>>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }

    /// Moves a live worker to Terminating. A worker that already exited keeps
    /// its final status.
    pub fn mark_terminating(&self) {
        let mut status = self.status.lock();
        if status.is_alive() {
            *status = WorkerStatus::Terminating;
        }
    }

    /// Asks the worker to stop at its next check (between dequeues or frames).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn take_thread(&mut self) -> Option<JoinHandle<WorkerSummary>> {
        self.thread.take()
    }

    /// Cancels a worker that never became ready. The status lock orders this
    /// against the worker's own Ready transition.
    fn abandon(&self) {
        let mut status = self.status.lock();
        self.cancel.store(true, Ordering::SeqCst);
        *status = WorkerStatus::Dead;
    }
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    results: Receiver<BatchResult>,
}

impl WorkerPool {
    /// Spawns `count` workers and waits up to `startup_timeout` for each to
    /// report whether its model loaded. Workers that fail, or do not answer in
    /// time, are marked dead; the pool is returned either way.
    pub fn spawn(
        count: usize,
        loader: Arc<dyn ModelLoader>,
        tasks: &TaskChannel,
        settings: WorkerSettings,
        startup_timeout: Duration,
        events: &dyn EventSink,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::Config("worker_count must be > 0".to_string()));
        }

        let (result_tx, result_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();
        let mut workers = Vec::with_capacity(count);
        let mut pending = BTreeSet::new();

        for id in 0..count {
            let status = Arc::new(Mutex::new(WorkerStatus::Starting));
            let cancel = Arc::new(AtomicBool::new(false));
            let context = WorkerContext {
                id,
                loader: loader.clone(),
                tasks: tasks.clone(),
                results: result_tx.clone(),
                ready: ready_tx.clone(),
                settings: settings.clone(),
                status: status.clone(),
                cancel: cancel.clone(),
            };

            let thread = thread::Builder::new()
                .name(format!("segmentfx-worker-{}", id))
                .spawn(move || context.run());

            let thread = match thread {
                Ok(handle) => {
                    pending.insert(id);
                    Some(handle)
                }
                Err(e) => {
                    *status.lock() = WorkerStatus::Dead;
                    error!(worker = id, error = %e, "failed to spawn worker thread");
                    events.emit(&PipelineEvent::WorkerStartupFailed {
                        worker_id: id,
                        reason: e.to_string(),
                    });
                    None
                }
            };

            workers.push(WorkerHandle {
                id,
                status,
                cancel,
                thread,
            });
        }
        drop(result_tx);
        drop(ready_tx);

        let deadline = Instant::now() + startup_timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(readiness) = ready_rx.recv_timeout(remaining) else {
                break;
            };
            pending.remove(&readiness.worker_id);
            match readiness.outcome {
                Ok(()) => events.emit(&PipelineEvent::WorkerReady {
                    worker_id: readiness.worker_id,
                }),
                Err(reason) => events.emit(&PipelineEvent::WorkerStartupFailed {
                    worker_id: readiness.worker_id,
                    reason,
                }),
            }
        }

        for id in pending {
            workers[id].abandon();
            events.emit(&PipelineEvent::WorkerStartupFailed {
                worker_id: id,
                reason: format!("not ready within {:?}", startup_timeout),
            });
        }

        let pool = Self {
            workers,
            results: result_rx,
        };
        info!(
            requested = count,
            live = pool.live_count(),
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn results(&self) -> &Receiver<BatchResult> {
        &self.results
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut [WorkerHandle] {
        &mut self.workers
    }

    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.status().is_alive()).count()
    }

    pub fn statuses(&self) -> Vec<(usize, WorkerStatus)> {
        self.workers.iter().map(|w| (w.id, w.status())).collect()
    }

    pub fn mark_terminating(&self) {
        for worker in &self.workers {
            worker.mark_terminating();
        }
    }

    pub fn cancel_all(&self) {
        for worker in &self.workers {
            worker.cancel();
        }
    }
}

/// Everything a worker thread owns.
struct WorkerContext {
    id: usize,
    loader: Arc<dyn ModelLoader>,
    tasks: TaskChannel,
    results: Sender<BatchResult>,
    ready: Sender<Readiness>,
    settings: WorkerSettings,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: Arc<AtomicBool>,
}

impl WorkerContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }

    /// Ready/Processing flips, ignored once the coordinator asked the worker
    /// to terminate.
    fn set_activity(&self, activity: WorkerStatus) {
        let mut status = self.status.lock();
        if *status != WorkerStatus::Terminating {
            *status = activity;
        }
    }

    fn report_ready(&self, outcome: std::result::Result<(), String>) {
        let _ = self.ready.send(Readiness {
            worker_id: self.id,
            outcome,
        });
    }

    fn run(self) -> WorkerSummary {
        let mut summary = WorkerSummary {
            worker_id: self.id,
            ..Default::default()
        };

        let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(self.id)));
        let mut model = match loaded {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return self.fail_startup(e.to_string(), summary),
            Err(payload) => return self.fail_startup(panic_message(payload.as_ref()), summary),
        };

        {
            let mut status = self.status.lock();
            if self.cancelled() {
                *status = WorkerStatus::Terminated;
                return summary;
            }
            *status = WorkerStatus::Ready;
        }
        info!(worker = self.id, model = model.name(), "worker ready");
        self.report_ready(Ok(()));

        while !self.cancelled() {
            match self.tasks.dequeue(self.settings.dequeue_timeout) {
                Ok(Task::Sentinel) => {
                    summary.sentinels_seen += 1;
                    debug!(worker = self.id, "sentinel received");
                    break;
                }
                Ok(Task::Batch(batch)) => {
                    self.set_activity(WorkerStatus::Processing);
                    let result = self.process_batch(model.as_mut(), batch);
                    if result.is_ok() {
                        summary.batches_processed += 1;
                    } else {
                        summary.batches_failed += 1;
                    }
                    if self.results.send(result).is_err() {
                        warn!(worker = self.id, "result channel closed, result dropped");
                    }
                    self.set_activity(WorkerStatus::Ready);
                }
                Err(e) if e.is_transient() => {
                    debug!(worker = self.id, "no task yet, polling again");
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "task channel unusable, worker exiting");
                    break;
                }
            }
        }

        self.set_status(WorkerStatus::Terminated);
        debug!(
            worker = self.id,
            processed = summary.batches_processed,
            failed = summary.batches_failed,
            "worker stopped"
        );
        summary
    }

    fn fail_startup(&self, reason: String, summary: WorkerSummary) -> WorkerSummary {
        let err = Error::WorkerStartup {
            worker: self.id,
            reason: reason.clone(),
        };
        error!(error = %err, "model failed to load");
        self.set_status(WorkerStatus::Dead);
        self.report_ready(Err(reason));
        summary
    }

    fn process_batch(&self, model: &mut dyn SegmentationModel, batch: Batch) -> BatchResult {
        let started = Instant::now();
        let indices = batch.frame_indices();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut frames = Vec::with_capacity(batch.len());
            for frame in &batch.frames {
                if self.cancelled() {
                    return Err("worker cancelled".to_string());
                }
                let masks = segment_frame(model, frame, &self.settings.params)
                    .map_err(|e| format!("frame {}: {}", frame.index, e))?;
                frames.push(FrameResult::ok(frame.index, masks));
            }
            Ok(frames)
        }));

        let reason = match outcome {
            Ok(Ok(frames)) => {
                let processing_time = started.elapsed();
                debug!(
                    worker = self.id,
                    batch = batch.id,
                    frames = frames.len(),
                    elapsed_ms = processing_time.as_millis() as u64,
                    "batch processed"
                );
                return BatchResult {
                    batch_id: batch.id,
                    worker_id: self.id,
                    frames,
                    processing_time,
                    status: FrameStatus::Ok,
                    error: None,
                };
            }
            Ok(Err(reason)) => reason,
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };

        let err = Error::BatchProcessing {
            batch: batch.id,
            reason,
        };
        warn!(worker = self.id, error = %err, "batch failed");
        BatchResult::failed(batch.id, self.id, &indices, err.to_string())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
