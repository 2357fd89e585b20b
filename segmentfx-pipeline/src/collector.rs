//! Result collection
//!
//! Waits on the result channel with a bounded timeout until every dispatched
//! batch has reported, or until too many waits in a row come back empty. Results
//! arrive in any order and are handed downstream sorted by batch id.

use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use segmentfx_core::{BatchResult, EventSink, PipelineEvent, TimeoutConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A result message that names the batch it belongs to.
pub trait Tagged {
    fn batch_id(&self) -> usize;
    fn is_ok(&self) -> bool;
    fn processing_time(&self) -> Duration;
}

impl Tagged for BatchResult {
    fn batch_id(&self) -> usize {
        self.batch_id
    }

    fn is_ok(&self) -> bool {
        BatchResult::is_ok(self)
    }

    fn processing_time(&self) -> Duration {
        self.processing_time
    }
}

/// Aggregate state of one pipeline run. Created at run start, updated by the
/// collector, dropped when the run ends.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub expected: usize,
    pub received: usize,
    pub failed: usize,
    pub consecutive_timeouts: u32,
    /// Sum of the processing times of successful batches
    pub processing_time: Duration,
}

impl PipelineRun {
    pub fn new(expected: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            expected,
            received: 0,
            failed: 0,
            consecutive_timeouts: 0,
            processing_time: Duration::ZERO,
        }
    }

    fn record_result(&mut self, ok: bool, processing_time: Duration) {
        self.received += 1;
        self.consecutive_timeouts = 0;
        if ok {
            self.processing_time += processing_time;
        } else {
            self.failed += 1;
        }
    }

    fn record_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.consecutive_timeouts
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// What the collector gathered.
#[derive(Debug)]
pub struct Collection<T> {
    /// Received results, sorted by batch id
    pub results: Vec<T>,
    /// Expected batch ids that never reported
    pub missing: Vec<usize>,
    /// Batch ids whose result reported a failure
    pub failed: Vec<usize>,
    /// Collection stopped on the consecutive-timeout threshold
    pub aborted: bool,
}

impl<T> Collection<T> {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ResultCollector {
    timeout: Duration,
    max_consecutive_timeouts: u32,
}

impl ResultCollector {
    pub fn new(timeout: Duration, max_consecutive_timeouts: u32) -> Self {
        Self {
            timeout,
            max_consecutive_timeouts,
        }
    }

    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self::new(timeouts.result, timeouts.max_consecutive_timeouts)
    }

    pub fn collect<T: Tagged>(
        &self,
        receiver: &Receiver<T>,
        expected_ids: &[usize],
        run: &mut PipelineRun,
        events: &dyn EventSink,
    ) -> Collection<T> {
        self.collect_with(receiver, expected_ids, run, events, |_| {})
    }

    /// Like [`collect`](Self::collect), calling `on_result` for each accepted
    /// result in arrival order.
    pub fn collect_with<T: Tagged>(
        &self,
        receiver: &Receiver<T>,
        expected_ids: &[usize],
        run: &mut PipelineRun,
        events: &dyn EventSink,
        mut on_result: impl FnMut(&T),
    ) -> Collection<T> {
        let expected: BTreeSet<usize> = expected_ids.iter().copied().collect();
        let mut received: BTreeMap<usize, T> = BTreeMap::new();
        let mut aborted = false;

        while received.len() < expected.len() {
            match receiver.recv_timeout(self.timeout) {
                Ok(result) => {
                    let id = result.batch_id();
                    if !expected.contains(&id) {
                        warn!(batch = id, "result for unknown batch dropped");
                        continue;
                    }
                    if received.contains_key(&id) {
                        warn!(batch = id, "duplicate result dropped");
                        continue;
                    }

                    run.record_result(result.is_ok(), result.processing_time());
                    events.emit(&PipelineEvent::BatchCompleted {
                        batch_id: id,
                        ok: result.is_ok(),
                        received: received.len() + 1,
                        expected: expected.len(),
                    });
                    on_result(&result);
                    received.insert(id, result);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let consecutive = run.record_timeout();
                    events.emit(&PipelineEvent::ResultTimeout {
                        consecutive,
                        threshold: self.max_consecutive_timeouts,
                    });
                    if consecutive > self.max_consecutive_timeouts {
                        events.emit(&PipelineEvent::RunAborted {
                            collected: received.len(),
                            expected: expected.len(),
                        });
                        aborted = true;
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(
                        collected = received.len(),
                        expected = expected.len(),
                        "result channel closed before collection finished"
                    );
                    break;
                }
            }
        }

        let missing: Vec<usize> = expected
            .iter()
            .filter(|id| !received.contains_key(id))
            .copied()
            .collect();
        let failed: Vec<usize> = received
            .values()
            .filter(|r| !r.is_ok())
            .map(|r| r.batch_id())
            .collect();
        debug!(
            collected = received.len(),
            missing = missing.len(),
            failed = failed.len(),
            "collection finished"
        );

        Collection {
            results: received.into_values().collect(),
            missing,
            failed,
            aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use segmentfx_core::RecordingSink;

    #[derive(Debug)]
    struct Msg {
        id: usize,
        ok: bool,
    }

    impl Tagged for Msg {
        fn batch_id(&self) -> usize {
            self.id
        }

        fn is_ok(&self) -> bool {
            self.ok
        }

        fn processing_time(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    fn msg(id: usize) -> Msg {
        Msg { id, ok: true }
    }

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn test_sorts_out_of_order_arrivals() {
        let (tx, rx) = unbounded();
        for id in [3, 0, 2, 1] {
            tx.send(msg(id)).unwrap();
        }
        let mut run = PipelineRun::new(4);
        let events = RecordingSink::new();
        let collection =
            ResultCollector::new(SHORT, 5).collect(&rx, &[0, 1, 2, 3], &mut run, &events);

        let ids: Vec<usize> = collection.results.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(collection.is_complete());
        assert!(!collection.aborted);
        assert!(run.is_complete());
        assert_eq!(run.processing_time, Duration::from_millis(40));
        assert_eq!(
            events.count(|e| matches!(e, PipelineEvent::BatchCompleted { .. })),
            4
        );
    }

    #[test]
    fn test_aborts_after_threshold_exceeded() {
        let (tx, rx) = unbounded::<Msg>();
        tx.send(msg(0)).unwrap();
        let mut run = PipelineRun::new(3);
        let events = RecordingSink::new();
        let collection = ResultCollector::new(SHORT, 5).collect(&rx, &[0, 1, 2], &mut run, &events);

        assert!(collection.aborted);
        assert_eq!(collection.results.len(), 1);
        assert_eq!(collection.missing, vec![1, 2]);
        assert_eq!(run.consecutive_timeouts, 6);
        assert_eq!(
            events.count(|e| matches!(e, PipelineEvent::ResultTimeout { .. })),
            6
        );
        assert_eq!(
            events.count(|e| matches!(e, PipelineEvent::RunAborted { collected: 1, expected: 3 })),
            1
        );
        drop(tx);
    }

    #[test]
    fn test_receive_resets_timeout_counter() {
        let (tx, rx) = unbounded();
        let sender = std::thread::spawn(move || {
            for id in 0..3 {
                // each gap spans a few timeouts, never more than the threshold
                std::thread::sleep(SHORT * 3);
                tx.send(msg(id)).unwrap();
            }
        });
        let mut run = PipelineRun::new(3);
        let collection = ResultCollector::new(SHORT, 20).collect(
            &rx,
            &[0, 1, 2],
            &mut run,
            &RecordingSink::new(),
        );
        sender.join().unwrap();

        assert!(collection.is_complete());
        assert_eq!(run.consecutive_timeouts, 0);
    }

    #[test]
    fn test_duplicates_and_unknown_ids_dropped() {
        let (tx, rx) = unbounded();
        tx.send(msg(0)).unwrap();
        tx.send(msg(0)).unwrap();
        tx.send(msg(9)).unwrap();
        tx.send(Msg { id: 1, ok: false }).unwrap();
        let mut run = PipelineRun::new(2);
        let collection =
            ResultCollector::new(SHORT, 5).collect(&rx, &[0, 1], &mut run, &RecordingSink::new());

        assert_eq!(collection.results.len(), 2);
        assert_eq!(collection.failed, vec![1]);
        assert_eq!(run.received, 2);
        assert_eq!(run.failed, 1);
        assert_eq!(run.processing_time, Duration::from_millis(10));
    }

    #[test]
    fn test_disconnected_channel_stops_immediately() {
        let (tx, rx) = unbounded();
        tx.send(msg(1)).unwrap();
        drop(tx);
        let mut run = PipelineRun::new(3);
        let collection = ResultCollector::new(Duration::from_secs(30), 5).collect(
            &rx,
            &[0, 1, 2],
            &mut run,
            &RecordingSink::new(),
        );
        assert!(!collection.aborted);
        assert_eq!(collection.missing, vec![0, 2]);
    }

    #[test]
    fn test_collect_with_sees_arrival_order() {
        let (tx, rx) = unbounded();
        for id in [2, 0, 1] {
            tx.send(msg(id)).unwrap();
        }
        let mut seen = Vec::new();
        let mut run = PipelineRun::new(3);
        ResultCollector::new(SHORT, 5).collect_with(
            &rx,
            &[0, 1, 2],
            &mut run,
            &RecordingSink::new(),
            |m| seen.push(m.id),
        );
        assert_eq!(seen, vec![2, 0, 1]);
    }
}
