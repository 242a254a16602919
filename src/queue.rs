//! Bounded stage-to-stage links and the pipeline stop token.
//!
//! Every edge in the graph is a fixed-capacity FIFO built on a
//! `crossbeam_channel::bounded` channel, so occupancy can never exceed the
//! declared capacity. Two overflow policies exist:
//!
//! - `Block`: a full link suspends the producer until the consumer makes
//!   room or the pipeline stop token fires (the push then fails with a
//!   cancellation outcome instead of deadlocking).
//! - `DropOldest`: a full link evicts its oldest queued item and admits the
//!   new one; the producer never blocks. Used where freshness beats
//!   completeness, e.g. directly behind a camera. Evicted frames release
//!   their buffers immediately (zeroized on drop).
//!
//! Links are the only shared, concurrently-accessed resource in the graph;
//! ownership of an item transfers through the channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::monitor::{Monitor, PipelineEvent};

// ----------------------------------------------------------------------------
// Stop token
// ----------------------------------------------------------------------------

/// Uninhabited message type: the stop channel only ever signals by
/// disconnecting.
pub enum Never {}

/// Fires the pipeline-wide stop signal. Cloneable so both the control handle
/// and a fatal-error path can fire it; firing twice is a no-op.
#[derive(Clone)]
pub struct StopTrigger {
    tx: Arc<Mutex<Option<Sender<Never>>>>,
}

impl StopTrigger {
    pub fn fire(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    pub fn is_fired(&self) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.is_none()
    }
}

/// Observes the stop signal. Every blocked queue operation selects against
/// this token so a stop wakes it promptly.
#[derive(Clone)]
pub struct StopToken {
    rx: Receiver<Never>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block up to `timeout` waiting for the stop signal. Returns true when
    /// stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        )
    }

    pub(crate) fn receiver(&self) -> &Receiver<Never> {
        &self.rx
    }
}

/// Create a paired trigger and token. The token clones into every stage.
pub fn stop_channel() -> (StopTrigger, StopToken) {
    let (tx, rx) = bounded::<Never>(0);
    (
        StopTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        StopToken { rx },
    )
}

// ----------------------------------------------------------------------------
// Link construction
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Block,
    DropOldest,
}

#[derive(Clone, Copy, Debug)]
pub struct QueueSpec {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl QueueSpec {
    pub fn blocking(capacity: usize) -> Self {
        Self {
            capacity,
            policy: OverflowPolicy::Block,
        }
    }

    pub fn leaky(capacity: usize) -> Self {
        Self {
            capacity,
            policy: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        // Matches the stream defaults the graph was tuned for upstream.
        Self::blocking(30)
    }
}

/// How long a blocking push may wait before the monitor emits a liveness
/// warning for the link.
const DEFAULT_STALL_WARN: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Leaky overflow: this many older items were evicted (and released) to
    /// admit the new one.
    DroppedOldest { evicted: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum LinkSendError {
    /// The pipeline stop token fired while the push was blocked.
    Stopped,
    /// The consumer side is gone.
    Disconnected,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LinkRecvError {
    /// The pipeline stop token fired.
    Stopped,
    /// Producer gone and the queue is drained: normal end-of-stream.
    Closed,
}

/// Producer half of a link. One stage holds this exclusively.
pub struct LinkSender<T> {
    name: Arc<str>,
    tx: Sender<T>,
    /// Leaky links evict through a receiver clone. Absent for Block so the
    /// sender still observes consumer disconnects.
    evict_rx: Option<Receiver<T>>,
    stop: StopToken,
    monitor: Monitor,
    stall_warn: Duration,
}

/// Consumer half of a link. One stage holds this exclusively (the joiner
/// holds two, one per input).
pub struct LinkReceiver<T> {
    name: Arc<str>,
    rx: Receiver<T>,
    stop: StopToken,
}

/// Build a named bounded link. Capacity must be at least 1.
pub fn link<T>(
    name: impl Into<String>,
    spec: QueueSpec,
    stop: StopToken,
    monitor: Monitor,
) -> (LinkSender<T>, LinkReceiver<T>) {
    assert!(spec.capacity >= 1, "queue capacity must be >= 1");
    let name: Arc<str> = Arc::from(name.into());
    let (tx, rx) = bounded(spec.capacity);
    let evict_rx = match spec.policy {
        OverflowPolicy::Block => None,
        OverflowPolicy::DropOldest => Some(rx.clone()),
    };
    (
        LinkSender {
            name: name.clone(),
            tx,
            evict_rx,
            stop: stop.clone(),
            monitor,
            stall_warn: DEFAULT_STALL_WARN,
        },
        LinkReceiver { name, rx, stop },
    )
}

impl<T> LinkSender<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn set_stall_warn(&mut self, stall_warn: Duration) {
        self.stall_warn = stall_warn;
    }

    /// Push one item according to the link policy.
    pub fn send(&self, item: T) -> Result<SendOutcome, LinkSendError> {
        match &self.evict_rx {
            None => self.send_blocking(item),
            Some(rx) => self.send_leaky(rx, item),
        }
    }

    fn send_blocking(&self, item: T) -> Result<SendOutcome, LinkSendError> {
        // Fast path: space available.
        let mut slot = match self.tx.try_send(item) {
            Ok(()) => return Ok(SendOutcome::Sent),
            Err(TrySendError::Full(item)) => Some(item),
            Err(TrySendError::Disconnected(_)) => return Err(LinkSendError::Disconnected),
        };

        let blocked_at = Instant::now();
        let mut warned = false;
        loop {
            crossbeam_channel::select! {
                send(self.tx, slot.take().expect("slot filled while blocked")) -> res => {
                    return match res {
                        Ok(()) => Ok(SendOutcome::Sent),
                        Err(_) => Err(LinkSendError::Disconnected),
                    };
                }
                recv(self.stop.receiver()) -> _ => {
                    return Err(LinkSendError::Stopped);
                }
                default(self.stall_warn) => {
                    // Still blocked: downstream needs capacity, not pipeline
                    // logic. Surface it once per blocked push.
                    if !warned {
                        self.monitor.report(PipelineEvent::QueueStalled {
                            link: self.name.to_string(),
                            waited_ms: blocked_at.elapsed().as_millis() as u64,
                        });
                        warned = true;
                    }
                }
            }
        }
    }

    fn send_leaky(&self, evict_rx: &Receiver<T>, item: T) -> Result<SendOutcome, LinkSendError> {
        let mut slot = item;
        let mut evicted = 0u64;
        loop {
            match self.tx.try_send(slot) {
                Ok(()) => {
                    if evicted > 0 {
                        self.monitor.report(PipelineEvent::QueueDrop {
                            link: self.name.to_string(),
                            evicted,
                        });
                        return Ok(SendOutcome::DroppedOldest { evicted });
                    }
                    return Ok(SendOutcome::Sent);
                }
                Err(TrySendError::Full(item)) => {
                    slot = item;
                    match evict_rx.try_recv() {
                        // Dropping the evicted item releases its buffers now.
                        Ok(old) => {
                            drop(old);
                            evicted += 1;
                        }
                        // Consumer made room between the two calls; retry.
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => {
                            return Err(LinkSendError::Disconnected)
                        }
                    }
                    if self.stop.is_stopped() {
                        return Err(LinkSendError::Stopped);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(LinkSendError::Disconnected),
            }
        }
    }
}

impl<T> LinkReceiver<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pop the next item, waking with `Stopped` if the pipeline stops while
    /// blocked, or `Closed` when the producer is gone and the queue drained.
    pub fn recv(&self) -> Result<T, LinkRecvError> {
        crossbeam_channel::select! {
            recv(self.rx) -> res => res.map_err(|_| LinkRecvError::Closed),
            recv(self.stop.receiver()) -> _ => Err(LinkRecvError::Stopped),
        }
    }

    /// Pop with a deadline; used by the joiner to service correlation
    /// timeouts while idle.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, LinkRecvError> {
        if self.stop.is_stopped() {
            return Err(LinkRecvError::Stopped);
        }
        crossbeam_channel::select! {
            recv(self.rx) -> res => res.map(Some).map_err(|_| LinkRecvError::Closed),
            recv(self.stop.receiver()) -> _ => Err(LinkRecvError::Stopped),
            default(timeout) => Ok(None),
        }
    }

    pub fn try_recv(&self) -> Result<Option<T>, LinkRecvError> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LinkRecvError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn inner(&self) -> &Receiver<T> {
        &self.rx
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_link<T>(spec: QueueSpec) -> (LinkSender<T>, LinkReceiver<T>, StopTrigger, Monitor) {
        let (trigger, token) = stop_channel();
        let monitor = Monitor::new();
        let (tx, rx) = link("test", spec, token, monitor.clone());
        (tx, rx, trigger, monitor)
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let (tx, rx, _trigger, _monitor) = test_link::<u32>(QueueSpec::leaky(3));
        for i in 0..50 {
            tx.send(i).expect("leaky send");
            assert!(rx.len() <= 3, "occupancy {} over capacity", rx.len());
            if i % 7 == 0 {
                let _ = rx.try_recv();
            }
        }
        assert!(rx.len() <= 3);
    }

    #[test]
    fn drop_oldest_retains_newest_items() {
        let (tx, rx, _trigger, monitor) = test_link::<u32>(QueueSpec::leaky(3));
        for i in 0..10u32 {
            tx.send(i).expect("leaky send never blocks");
        }
        let mut remaining = Vec::new();
        while let Ok(Some(v)) = rx.try_recv() {
            remaining.push(v);
        }
        assert_eq!(remaining, vec![7, 8, 9]);
        assert_eq!(monitor.queue_drops(), 7);
    }

    #[test]
    fn blocking_push_suspends_until_pop() {
        let (tx, rx, _trigger, _monitor) = test_link::<u32>(QueueSpec::blocking(5));
        for i in 0..5 {
            assert_eq!(tx.send(i).unwrap(), SendOutcome::Sent);
        }

        let producer = thread::spawn(move || tx.send(5));
        // The 6th push must be blocked, not completed.
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().unwrap(), 0);
        assert_eq!(producer.join().unwrap().unwrap(), SendOutcome::Sent);

        let mut remaining = Vec::new();
        while let Ok(Some(v)) = rx.try_recv() {
            remaining.push(v);
        }
        assert_eq!(remaining, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stop_wakes_blocked_push() {
        let (tx, _rx, trigger, _monitor) = test_link::<u32>(QueueSpec::blocking(1));
        tx.send(0).unwrap();

        let producer = thread::spawn(move || tx.send(1));
        thread::sleep(Duration::from_millis(20));
        trigger.fire();
        assert_eq!(producer.join().unwrap(), Err(LinkSendError::Stopped));
    }

    #[test]
    fn stop_wakes_blocked_recv() {
        let (_tx, rx, trigger, _monitor) = test_link::<u32>(QueueSpec::blocking(1));
        let consumer = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        trigger.fire();
        assert_eq!(consumer.join().unwrap(), Err(LinkRecvError::Stopped));
    }

    #[test]
    fn closed_link_reports_end_of_stream() {
        let (tx, rx, _trigger, _monitor) = test_link::<u32>(QueueSpec::blocking(2));
        tx.send(1).unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv(), Err(LinkRecvError::Closed));
    }

    #[test]
    fn stalled_blocking_push_emits_liveness_warning() {
        let (mut tx, rx, _trigger, monitor) = test_link::<u32>(QueueSpec::blocking(1));
        tx.set_stall_warn(Duration::from_millis(10));
        tx.send(0).unwrap();

        let producer = thread::spawn(move || tx.send(1));
        thread::sleep(Duration::from_millis(60));
        let _ = rx.recv();
        producer.join().unwrap().unwrap();

        assert!(monitor
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::QueueStalled { .. })));
    }
}
