//! Branch synchronizer: the splitter/joiner pair around the face sub-path.
//!
//! The splitter fans each frame into per-detection sub-items (cropped face
//! patches tagged with a correlation key) and forwards the frame itself on
//! the primary path with a pending count. The joiner reattaches finished
//! sub-results to the right detection slot regardless of completion order,
//! never emits a frame twice, and preserves the primary stream's FIFO
//! order: a frame that completes early is held until everything older has
//! gone out. A frame waits for its outstanding results at most `timeout`;
//! the pending map itself is bounded by `max_pending_frames`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::exec::FaceCropper;
use crate::frame::{Embedding, FacePatch, Frame, IdentityMatch};
use crate::monitor::{Monitor, PipelineEvent};
use crate::queue::{LinkRecvError, LinkReceiver, LinkSender, StopToken};

/// Pairs a sub-stream item with the detection slot it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub frame_id: u64,
    pub det_index: usize,
}

/// A cropped face on its way into the sub-path.
pub struct FacePatchItem {
    pub key: CorrelationKey,
    pub track_id: Option<u64>,
    pub patch: FacePatch,
}

/// Sub-path output of the embedding stage.
pub struct EmbeddedFace {
    pub key: CorrelationKey,
    pub track_id: Option<u64>,
    pub embedding: Embedding,
}

/// Sub-path output of the gallery matcher, ready for the joiner.
pub struct MatchedFace {
    pub key: CorrelationKey,
    pub track_id: Option<u64>,
    pub embedding: Embedding,
    pub identity: Option<IdentityMatch>,
}

/// Primary-path payload between splitter and joiner.
pub struct SplitFrame {
    pub frame: Frame,
    /// How many sub-results the joiner must collect before forwarding.
    pub expected: usize,
}

/// Joiner bounds.
#[derive(Clone, Copy, Debug)]
pub struct JoinerConfig {
    /// How long a frame may wait for outstanding sub-results.
    pub timeout: Duration,
    /// Upper bound on frames held in the pending map.
    pub max_pending_frames: usize,
    /// Fill detections that got no fresh sub-result from the last result
    /// seen for the same track.
    pub keep_past_metadata: bool,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_pending_frames: 64,
            keep_past_metadata: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Splitter
// ----------------------------------------------------------------------------

/// Spawn the splitter worker. For a frame with K detections it emits K
/// correlated crops into `sub` and the frame (pending count K) into
/// `primary`. A failed crop reduces K and is reported as a skipped item.
pub fn spawn_splitter(
    mut cropper: Box<dyn FaceCropper>,
    input: LinkReceiver<Frame>,
    primary: LinkSender<SplitFrame>,
    sub: LinkSender<FacePatchItem>,
    monitor: Monitor,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("splitter".into())
        .spawn(move || loop {
            let frame = match input.recv() {
                Ok(frame) => frame,
                // Both senders drop on the way out, closing both paths.
                Err(LinkRecvError::Closed) | Err(LinkRecvError::Stopped) => return,
            };

            let mut expected = 0usize;
            for det_index in 0..frame.meta.len() {
                let (bbox, track_id) = {
                    let det = &frame.meta.detections()[det_index];
                    (det.bbox, det.track_id)
                };
                let patch = match cropper.crop(&frame, &bbox) {
                    Ok(patch) => patch,
                    Err(e) => {
                        monitor.report(PipelineEvent::ItemSkipped {
                            stage: "splitter".into(),
                            reason: format!("crop for detection {det_index}: {e}"),
                        });
                        continue;
                    }
                };
                let item = FacePatchItem {
                    key: CorrelationKey {
                        frame_id: frame.id(),
                        det_index,
                    },
                    track_id,
                    patch,
                };
                if sub.send(item).is_err() {
                    return;
                }
                expected += 1;
            }

            if primary.send(SplitFrame { frame, expected }).is_err() {
                return;
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn splitter thread: {e}"))
}

// ----------------------------------------------------------------------------
// Joiner
// ----------------------------------------------------------------------------

struct PendingFrame {
    frame: Frame,
    expected: usize,
    received: usize,
    filled: Vec<bool>,
    since: Instant,
}

impl PendingFrame {
    fn missing(&self) -> usize {
        self.expected - self.received
    }
}

/// A sub-result that outran its frame on the primary path.
struct EarlyResults {
    results: Vec<MatchedFace>,
    since: Instant,
}

/// Last embedding/identity seen per track, for `keep_past_metadata`.
struct TrackMetadataCache {
    entries: HashMap<u64, (Embedding, Option<IdentityMatch>)>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl TrackMetadataCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn record(&mut self, track_id: u64, embedding: Embedding, identity: Option<IdentityMatch>) {
        if self.entries.insert(track_id, (embedding, identity)).is_none() {
            self.order.push_back(track_id);
            while self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.entries.remove(&old);
                }
            }
        }
    }

    fn get(&self, track_id: u64) -> Option<&(Embedding, Option<IdentityMatch>)> {
        self.entries.get(&track_id)
    }
}

struct Joiner {
    cfg: JoinerConfig,
    output: LinkSender<Frame>,
    monitor: Monitor,
    /// Keyed by frame id; primary-path FIFO keeps this in arrival order.
    pending: BTreeMap<u64, PendingFrame>,
    /// Completed frames held until every older pending frame has gone out,
    /// so the primary stream never reorders.
    ready: BTreeMap<u64, PendingFrame>,
    early: HashMap<u64, EarlyResults>,
    past: TrackMetadataCache,
    /// Recently merged frame ids, to tell a late duplicate from a result for
    /// a frame the joiner never saw.
    merged_recently: VecDeque<u64>,
}

const MERGED_RING: usize = 128;
const PAST_METADATA_CAPACITY: usize = 256;

enum JoinerStep {
    Continue,
    Shutdown,
}

impl Joiner {
    fn new(cfg: JoinerConfig, output: LinkSender<Frame>, monitor: Monitor) -> Self {
        Self {
            cfg,
            output,
            monitor,
            pending: BTreeMap::new(),
            ready: BTreeMap::new(),
            early: HashMap::new(),
            past: TrackMetadataCache::new(PAST_METADATA_CAPACITY),
            merged_recently: VecDeque::with_capacity(MERGED_RING),
        }
    }

    fn on_primary(&mut self, split: SplitFrame) -> JoinerStep {
        let frame_id = split.frame.id();
        let detections = split.frame.meta.len();
        let mut pending = PendingFrame {
            frame: split.frame,
            expected: split.expected,
            received: 0,
            filled: vec![false; detections],
            since: Instant::now(),
        };

        if let Some(early) = self.early.remove(&frame_id) {
            for result in early.results {
                Self::attach(&mut pending, result, &self.monitor);
            }
        }

        if pending.received >= pending.expected {
            self.ready.insert(frame_id, pending);
        } else {
            self.pending.insert(frame_id, pending);
            self.enforce_pending_bound();
        }
        self.drain_ready()
    }

    fn on_sub(&mut self, result: MatchedFace) -> JoinerStep {
        let frame_id = result.key.frame_id;
        if let Some(pending) = self.pending.get_mut(&frame_id) {
            Self::attach(pending, result, &self.monitor);
            if pending.received >= pending.expected {
                if let Some(done) = self.pending.remove(&frame_id) {
                    self.ready.insert(frame_id, done);
                    return self.drain_ready();
                }
            }
            return JoinerStep::Continue;
        }

        if let Some(held) = self.ready.get_mut(&frame_id) {
            // Extra result for a frame already complete but not yet emitted.
            Self::attach(held, result, &self.monitor);
            return JoinerStep::Continue;
        }

        if self.merged_recently.contains(&frame_id) {
            // The frame already went downstream; re-delivery is a no-op.
            self.monitor.report(PipelineEvent::DuplicateResult {
                frame_id,
                det_index: result.key.det_index,
            });
            return JoinerStep::Continue;
        }

        // Result outran its frame on the primary path; stash it.
        self.early
            .entry(frame_id)
            .or_insert_with(|| EarlyResults {
                results: Vec::new(),
                since: Instant::now(),
            })
            .results
            .push(result);
        JoinerStep::Continue
    }

    fn attach(pending: &mut PendingFrame, result: MatchedFace, monitor: &Monitor) {
        let det_index = result.key.det_index;
        let already = pending.filled.get(det_index).copied();
        match already {
            Some(false) => {
                pending.filled[det_index] = true;
                pending.received += 1;
                if let Some(det) = pending.frame.meta.detection_mut(det_index) {
                    det.embedding = Some(result.embedding);
                    det.identity = result.identity;
                }
            }
            // Slot already filled, or the key names a slot that does not
            // exist on this frame.
            Some(true) | None => {
                monitor.report(PipelineEvent::DuplicateResult {
                    frame_id: result.key.frame_id,
                    det_index,
                });
            }
        }
    }

    fn finish(&mut self, mut pending: PendingFrame) -> JoinerStep {
        if self.cfg.keep_past_metadata {
            for det in pending.frame.meta.detections_mut() {
                if det.embedding.is_some() {
                    if let (Some(track_id), Some(embedding)) = (det.track_id, &det.embedding) {
                        self.past
                            .record(track_id, embedding.clone(), det.identity.clone());
                    }
                } else if let Some(track_id) = det.track_id {
                    if let Some((embedding, identity)) = self.past.get(track_id) {
                        det.embedding = Some(embedding.clone());
                        det.identity = identity.clone();
                    }
                }
            }
        }

        self.merged_recently.push_back(pending.frame.id());
        while self.merged_recently.len() > MERGED_RING {
            self.merged_recently.pop_front();
        }

        match self.output.send(pending.frame) {
            Ok(_) => JoinerStep::Continue,
            Err(_) => JoinerStep::Shutdown,
        }
    }

    /// Emit completed frames in id order, stopping at the first id still
    /// waiting in the pending map. A held frame goes out once everything
    /// older has been emitted or expired.
    fn drain_ready(&mut self) -> JoinerStep {
        while let Some((&ready_id, _)) = self.ready.iter().next() {
            if let Some((&pending_id, _)) = self.pending.iter().next() {
                if pending_id < ready_id {
                    break;
                }
            }
            if let Some(done) = self.ready.remove(&ready_id) {
                if let JoinerStep::Shutdown = self.finish(done) {
                    return JoinerStep::Shutdown;
                }
            }
        }
        JoinerStep::Continue
    }

    /// Forward every frame that has waited past the timeout with whatever
    /// arrived, and drop early-result stashes whose frame never showed up.
    fn expire(&mut self) -> JoinerStep {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= self.cfg.timeout)
            .map(|(id, _)| *id)
            .collect();
        for frame_id in expired {
            if let Some(pending) = self.pending.remove(&frame_id) {
                self.monitor.report(PipelineEvent::CorrelationTimeout {
                    frame_id,
                    missing: pending.missing(),
                });
                self.ready.insert(frame_id, pending);
            }
        }

        let stale: Vec<u64> = self
            .early
            .iter()
            .filter(|(_, e)| now.duration_since(e.since) >= self.cfg.timeout)
            .map(|(id, _)| *id)
            .collect();
        for frame_id in stale {
            if let Some(early) = self.early.remove(&frame_id) {
                self.monitor.report(PipelineEvent::OrphanedResults {
                    frame_id,
                    count: early.results.len(),
                });
            }
        }
        self.drain_ready()
    }

    /// The pending map bound: evict (release, not forward) the oldest frame.
    fn enforce_pending_bound(&mut self) {
        while self.pending.len() > self.cfg.max_pending_frames {
            if let Some((&frame_id, _)) = self.pending.iter().next() {
                if let Some(evicted) = self.pending.remove(&frame_id) {
                    self.monitor.report(PipelineEvent::PendingEvicted {
                        frame_id,
                        missing: evicted.missing(),
                    });
                    drop(evicted);
                }
            } else {
                break;
            }
        }
    }

    /// Flush everything still held or pending, oldest first, with partial
    /// results.
    fn flush_all(&mut self) {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for frame_id in ids {
            if let Some(pending) = self.pending.remove(&frame_id) {
                if pending.missing() > 0 {
                    self.monitor.report(PipelineEvent::CorrelationTimeout {
                        frame_id,
                        missing: pending.missing(),
                    });
                }
                self.ready.insert(frame_id, pending);
            }
        }
        let _ = self.drain_ready();
    }
}

/// Spawn the joiner worker over its two inputs.
pub fn spawn_joiner(
    cfg: JoinerConfig,
    primary_rx: LinkReceiver<SplitFrame>,
    sub_rx: LinkReceiver<MatchedFace>,
    output: LinkSender<Frame>,
    stop: StopToken,
    monitor: Monitor,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("joiner".into())
        .spawn(move || {
            let mut joiner = Joiner::new(cfg, output, monitor);
            let tick = (joiner.cfg.timeout / 4).max(Duration::from_millis(5));
            let mut primary_open = true;
            let mut sub_open = true;

            loop {
                if primary_open && sub_open {
                    crossbeam_channel::select! {
                        recv(primary_rx.inner()) -> res => match res {
                            Ok(split) => {
                                if let JoinerStep::Shutdown = joiner.on_primary(split) {
                                    return;
                                }
                            }
                            Err(_) => primary_open = false,
                        },
                        recv(sub_rx.inner()) -> res => match res {
                            Ok(result) => {
                                if let JoinerStep::Shutdown = joiner.on_sub(result) {
                                    return;
                                }
                            }
                            Err(_) => sub_open = false,
                        },
                        recv(stop.receiver()) -> _ => return,
                        default(tick) => {}
                    }
                } else if primary_open {
                    // Sub path gone: frames can only ever be partial now.
                    match primary_rx.recv_timeout(tick) {
                        Ok(Some(split)) => {
                            if let JoinerStep::Shutdown = joiner.on_primary(split) {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(LinkRecvError::Closed) => primary_open = false,
                        Err(LinkRecvError::Stopped) => return,
                    }
                } else if sub_open {
                    if joiner.pending.is_empty() {
                        // Nothing left to complete; remaining sub results
                        // belong to frames that will never arrive.
                        break;
                    }
                    match sub_rx.recv_timeout(tick) {
                        Ok(Some(result)) => {
                            if let JoinerStep::Shutdown = joiner.on_sub(result) {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(LinkRecvError::Closed) => sub_open = false,
                        Err(LinkRecvError::Stopped) => return,
                    }
                } else {
                    break;
                }

                if let JoinerStep::Shutdown = joiner.expire() {
                    return;
                }
            }

            joiner.flush_all();
        })
        .unwrap_or_else(|e| panic!("failed to spawn joiner thread: {e}"))
}
