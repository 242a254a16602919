//! Multi-frame association tracker.
//!
//! Detections are matched to live tracks by a gated, mutually-best greedy
//! assignment over IoU and predicted-center distance, then each track runs
//! its lifecycle transitions (`New -> Tracked -> Lost -> Removed`).

mod track;

pub use track::{Track, TrackState};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameMeta};
use crate::stage::{Stage, StageError};

/// Association gates and lifecycle windows.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Minimum IoU to associate a detection with a Tracked or Lost track.
    pub iou_thr: f32,
    /// Stricter IoU gate for tracks still in the New state.
    pub init_iou_thr: f32,
    /// Maximum predicted-center distance, normalized by the predicted box
    /// diagonal.
    pub dist_thr: f32,
    /// Consecutive associated frames before a New track becomes Tracked.
    pub keep_new_frames: u32,
    /// Frames a track may stay Lost before removal.
    pub keep_lost_frames: u32,
    /// Carry a track's last embedding and identity forward when a frame has
    /// no fresh result for it (applied downstream at the merge point).
    pub keep_past_metadata: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_thr: 0.8,
            init_iou_thr: 0.9,
            dist_thr: 0.7,
            keep_new_frames: 2,
            keep_lost_frames: 8,
            keep_past_metadata: true,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, v) in [
            ("iou_thr", self.iou_thr),
            ("init_iou_thr", self.init_iou_thr),
        ] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("tracker.{} must be in [0,1], got {}", name, v);
            }
        }
        if self.dist_thr <= 0.0 {
            anyhow::bail!("tracker.dist_thr must be positive");
        }
        Ok(())
    }
}

struct Candidate {
    score: f32,
    iou: f32,
    track_id: u64,
    det_index: usize,
}

/// The tracker proper. Single-owner mutable state; the hosting stage thread
/// is the only caller.
pub struct Tracker {
    cfg: TrackerConfig,
    /// BTreeMap keeps iteration in track-id order, which makes the greedy
    /// tie-break (lower identifier wins) deterministic.
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    pub fn live_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Associate the frame's detections with tracks and advance every track
    /// one frame. Detections gain a `track_id`; tracks are spawned for
    /// unmatched detections.
    pub fn update(&mut self, meta: &mut FrameMeta) {
        for track in self.tracks.values_mut() {
            track.predict();
        }

        let mut candidates = Vec::new();
        for track in self.tracks.values() {
            let gate = match track.state {
                TrackState::New => self.cfg.init_iou_thr,
                _ => self.cfg.iou_thr,
            };
            for (det_index, det) in meta.detections().iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou < gate {
                    continue;
                }
                let diag = (track.bbox.w.powi(2) + track.bbox.h.powi(2)).sqrt();
                let norm_dist = if diag > 0.0 {
                    track.bbox.center_distance(&det.bbox) / diag
                } else {
                    f32::MAX
                };
                if norm_dist > self.cfg.dist_thr {
                    continue;
                }
                candidates.push(Candidate {
                    score: iou + (1.0 - norm_dist.min(1.0)),
                    iou,
                    track_id: track.id,
                    det_index,
                });
            }
        }

        // Globally best pair first; ties by overlap, then lower identifier.
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.iou.total_cmp(&a.iou))
                .then(a.track_id.cmp(&b.track_id))
        });

        let mut det_assigned = vec![false; meta.len()];
        let mut track_assigned: Vec<u64> = Vec::new();
        for cand in &candidates {
            if det_assigned[cand.det_index] || track_assigned.contains(&cand.track_id) {
                continue;
            }
            det_assigned[cand.det_index] = true;
            track_assigned.push(cand.track_id);

            let det = meta
                .detection_mut(cand.det_index)
                .filter(|d| d.track_id.is_none());
            if let Some(det) = det {
                det.track_id = Some(cand.track_id);
                if let Some(track) = self.tracks.get_mut(&cand.track_id) {
                    track.observe(&det.bbox, self.cfg.keep_new_frames);
                }
            }
        }

        for track in self.tracks.values_mut() {
            if !track_assigned.contains(&track.id) {
                track.miss(self.cfg.keep_lost_frames);
            }
        }
        self.tracks.retain(|_, t| !t.is_removed());

        for (det_index, det) in meta.detections_mut().iter_mut().enumerate() {
            if !det_assigned[det_index] && det.track_id.is_none() {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.insert(id, Track::spawn(id, det.bbox));
                det.track_id = Some(id);
            }
        }
    }
}

/// Stage wrapper hosting the tracker on its own worker thread.
pub struct TrackerStage {
    tracker: Tracker,
}

impl TrackerStage {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            tracker: Tracker::new(cfg),
        }
    }
}

impl Stage<Frame, Frame> for TrackerStage {
    fn name(&self) -> &str {
        "tracker"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Vec<Frame>, StageError> {
        self.tracker.update(&mut frame.meta);
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection};

    fn meta_with_boxes(boxes: &[BoundingBox]) -> FrameMeta {
        let mut meta = FrameMeta::default();
        for b in boxes {
            meta.push_detection(Detection::new(*b, 0.9, "face"));
        }
        meta
    }

    #[test]
    fn stationary_detection_promotes_and_keeps_identifier() {
        // Three frames, same box, keep_new_frames = 2: New on frame 1,
        // Tracked by frame 3, one identifier throughout.
        let mut tracker = Tracker::new(TrackerConfig::default());
        let bbox = BoundingBox::new(100.0, 80.0, 40.0, 40.0);

        let mut m1 = meta_with_boxes(&[bbox]);
        tracker.update(&mut m1);
        let id = m1.detections()[0].track_id.unwrap();
        assert_eq!(tracker.live_tracks().next().unwrap().state, TrackState::New);

        let mut m2 = meta_with_boxes(&[bbox]);
        tracker.update(&mut m2);
        assert_eq!(m2.detections()[0].track_id, Some(id));

        let mut m3 = meta_with_boxes(&[bbox]);
        tracker.update(&mut m3);
        assert_eq!(m3.detections()[0].track_id, Some(id));
        assert_eq!(
            tracker.live_tracks().next().unwrap().state,
            TrackState::Tracked
        );
    }

    #[test]
    fn overlapping_detection_keeps_tracked_identifier() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let bbox = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        for _ in 0..3 {
            let mut m = meta_with_boxes(&[bbox]);
            tracker.update(&mut m);
        }
        let id = tracker.live_tracks().next().unwrap().id;

        // Shifted but still above the 0.8 IoU gate.
        let mut m = meta_with_boxes(&[BoundingBox::new(5.0, 0.0, 100.0, 100.0)]);
        tracker.update(&mut m);
        assert_eq!(m.detections()[0].track_id, Some(id));
    }

    #[test]
    fn lost_track_removed_after_keep_lost_frames() {
        let cfg = TrackerConfig {
            keep_lost_frames: 2,
            ..TrackerConfig::default()
        };
        let mut tracker = Tracker::new(cfg);
        let bbox = BoundingBox::new(0.0, 0.0, 50.0, 50.0);
        for _ in 0..3 {
            let mut m = meta_with_boxes(&[bbox]);
            tracker.update(&mut m);
        }
        assert_eq!(
            tracker.live_tracks().next().unwrap().state,
            TrackState::Tracked
        );

        for _ in 0..2 {
            let mut m = meta_with_boxes(&[]);
            tracker.update(&mut m);
            assert_eq!(tracker.live_tracks().count(), 1);
        }
        let mut m = meta_with_boxes(&[]);
        tracker.update(&mut m);
        assert_eq!(tracker.live_tracks().count(), 0);
    }

    #[test]
    fn identifiers_are_never_reissued() {
        let mut tracker = Tracker::new(TrackerConfig {
            keep_lost_frames: 0,
            ..TrackerConfig::default()
        });
        let bbox = BoundingBox::new(0.0, 0.0, 50.0, 50.0);

        let mut m = meta_with_boxes(&[bbox]);
        tracker.update(&mut m);
        let first = m.detections()[0].track_id.unwrap();

        // One empty frame removes the New track.
        let mut empty = meta_with_boxes(&[]);
        tracker.update(&mut empty);
        assert_eq!(tracker.live_tracks().count(), 0);

        let mut m = meta_with_boxes(&[bbox]);
        tracker.update(&mut m);
        let second = m.detections()[0].track_id.unwrap();
        assert!(second > first);
    }

    #[test]
    fn two_detections_assign_mutually_best_pairs() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let a = BoundingBox::new(0.0, 0.0, 40.0, 40.0);
        let b = BoundingBox::new(200.0, 0.0, 40.0, 40.0);
        for _ in 0..3 {
            let mut m = meta_with_boxes(&[a, b]);
            tracker.update(&mut m);
        }
        let mut m = meta_with_boxes(&[b, a]);
        tracker.update(&mut m);
        // Ids follow the boxes, not the detection order.
        let id_b = m.detections()[0].track_id.unwrap();
        let id_a = m.detections()[1].track_id.unwrap();
        assert_ne!(id_a, id_b);
        assert!(id_a < id_b);
    }

    #[test]
    fn lost_track_reassociates_after_gap() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let bbox = BoundingBox::new(20.0, 20.0, 60.0, 60.0);
        for _ in 0..3 {
            let mut m = meta_with_boxes(&[bbox]);
            tracker.update(&mut m);
        }
        let id = tracker.live_tracks().next().unwrap().id;

        let mut gap = meta_with_boxes(&[]);
        tracker.update(&mut gap);
        assert_eq!(tracker.live_tracks().next().unwrap().state, TrackState::Lost);

        let mut back = meta_with_boxes(&[bbox]);
        tracker.update(&mut back);
        assert_eq!(back.detections()[0].track_id, Some(id));
        assert_eq!(
            tracker.live_tracks().next().unwrap().state,
            TrackState::Tracked
        );
    }
}
