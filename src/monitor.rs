//! Pipeline observability channel.
//!
//! Per-item errors, queue drops, correlation timeouts and liveness warnings
//! are recovered locally; this module is how they are reported. Events go to
//! the process log and into a bounded in-memory record that tests and the
//! daemon health loop can inspect. Stage-fatal errors do NOT go through
//! here; they propagate to pipeline control.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A recoverable condition observed somewhere in the graph.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// A stage skipped one malformed item and continued.
    ItemSkipped { stage: String, reason: String },
    /// A leaky queue evicted items to admit a newer one.
    QueueDrop { link: String, evicted: u64 },
    /// A blocking push waited longer than the stall threshold.
    QueueStalled { link: String, waited_ms: u64 },
    /// The joiner gave up waiting for sub-results and forwarded a partial
    /// frame.
    CorrelationTimeout { frame_id: u64, missing: usize },
    /// The joiner's pending map hit its bound and released its oldest frame.
    PendingEvicted { frame_id: u64, missing: usize },
    /// Stashed sub-results were discarded because their frame never arrived
    /// on the primary path.
    OrphanedResults { frame_id: u64, count: usize },
    /// A sub-result arrived for a detection slot that was already filled, or
    /// for a frame already merged.
    DuplicateResult { frame_id: u64, det_index: usize },
    /// The gallery matcher attached an identity to a detection.
    IdentityMatched {
        frame_id: u64,
        det_index: usize,
        label: String,
        similarity: f32,
    },
}

#[derive(Default)]
struct Counters {
    items_skipped: AtomicU64,
    queue_drops: AtomicU64,
    correlation_timeouts: AtomicU64,
    duplicates: AtomicU64,
    identities_matched: AtomicU64,
}

struct MonitorInner {
    events: Mutex<VecDeque<PipelineEvent>>,
    capacity: usize,
    counters: Counters,
}

/// Cheap cloneable handle shared by every stage runner.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                capacity: capacity.max(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn report(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::ItemSkipped { stage, reason } => {
                self.inner.counters.items_skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("stage {} skipped item: {}", stage, reason);
            }
            PipelineEvent::QueueDrop { link, evicted } => {
                self.inner.counters.queue_drops.fetch_add(*evicted, Ordering::Relaxed);
                log::debug!("queue {} dropped {} item(s) (leaky overflow)", link, evicted);
            }
            PipelineEvent::QueueStalled { link, waited_ms } => {
                log::warn!(
                    "queue {} producer stalled for {} ms; downstream not keeping up",
                    link,
                    waited_ms
                );
            }
            PipelineEvent::CorrelationTimeout { frame_id, missing } => {
                self.inner
                    .counters
                    .correlation_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "frame {} forwarded with {} sub-result(s) missing (correlation timeout)",
                    frame_id,
                    missing
                );
            }
            PipelineEvent::PendingEvicted { frame_id, missing } => {
                self.inner
                    .counters
                    .correlation_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "pending map full: frame {} released with {} sub-result(s) missing",
                    frame_id,
                    missing
                );
            }
            PipelineEvent::OrphanedResults { frame_id, count } => {
                log::warn!(
                    "discarded {} stashed sub-result(s) for frame {} that never arrived",
                    count,
                    frame_id
                );
            }
            PipelineEvent::DuplicateResult { frame_id, det_index } => {
                self.inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "duplicate sub-result for frame {} detection {} ignored",
                    frame_id,
                    det_index
                );
            }
            PipelineEvent::IdentityMatched {
                frame_id,
                det_index,
                label,
                similarity,
            } => {
                self.inner
                    .counters
                    .identities_matched
                    .fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "frame {} detection {}: recognized '{}' (similarity {:.2})",
                    frame_id,
                    det_index,
                    label,
                    similarity
                );
            }
        }

        let mut events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() >= self.inner.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of the retained event record, oldest first.
    pub fn events(&self) -> Vec<PipelineEvent> {
        let events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().cloned().collect()
    }

    pub fn items_skipped(&self) -> u64 {
        self.inner.counters.items_skipped.load(Ordering::Relaxed)
    }

    pub fn queue_drops(&self) -> u64 {
        self.inner.counters.queue_drops.load(Ordering::Relaxed)
    }

    pub fn correlation_timeouts(&self) -> u64 {
        self.inner.counters.correlation_timeouts.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.inner.counters.duplicates.load(Ordering::Relaxed)
    }

    pub fn identities_matched(&self) -> u64 {
        self.inner.counters.identities_matched.load(Ordering::Relaxed)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_record_is_bounded() {
        let monitor = Monitor::with_capacity(4);
        for i in 0..10 {
            monitor.report(PipelineEvent::QueueDrop {
                link: format!("q{}", i),
                evicted: 1,
            });
        }
        let events = monitor.events();
        assert_eq!(events.len(), 4);
        // Oldest entries were displaced.
        assert_eq!(
            events[0],
            PipelineEvent::QueueDrop {
                link: "q6".to_string(),
                evicted: 1
            }
        );
        assert_eq!(monitor.queue_drops(), 10);
    }

    #[test]
    fn counters_track_event_kinds() {
        let monitor = Monitor::new();
        monitor.report(PipelineEvent::ItemSkipped {
            stage: "detect".to_string(),
            reason: "truncated buffer".to_string(),
        });
        monitor.report(PipelineEvent::CorrelationTimeout {
            frame_id: 7,
            missing: 2,
        });
        assert_eq!(monitor.items_skipped(), 1);
        assert_eq!(monitor.correlation_timeouts(), 1);
        assert_eq!(monitor.queue_drops(), 0);
    }
}
