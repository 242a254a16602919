use crate::frame::BoundingBox;

/// Lifecycle of one track. `Removed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    New,
    Tracked,
    Lost,
    Removed,
}

/// One tracked object: identifier, constant-velocity motion estimate and the
/// age counters driving the state machine.
///
/// Identifiers are assigned once and never reissued, even after removal.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: u64,
    pub state: TrackState,
    /// Predicted position for the current frame, advanced by `predict`.
    pub bbox: BoundingBox,
    /// Per-frame center displacement.
    pub velocity: (f32, f32),
    /// Consecutive frames with an association while `New`.
    pub new_frames: u32,
    /// Consecutive frames with an association while `Tracked`.
    pub tracked_frames: u32,
    /// Consecutive frames without an association while `Lost`.
    pub lost_frames: u32,
}

impl Track {
    pub fn spawn(id: u64, bbox: BoundingBox) -> Self {
        Self {
            id,
            state: TrackState::New,
            bbox,
            velocity: (0.0, 0.0),
            new_frames: 0,
            tracked_frames: 0,
            lost_frames: 0,
        }
    }

    /// Advance the motion model one frame. Lost tracks keep coasting on the
    /// last velocity estimate so a re-appearing object can still gate in.
    pub fn predict(&mut self) {
        self.bbox.x += self.velocity.0;
        self.bbox.y += self.velocity.1;
    }

    /// Fold an associated observation into the track and run the state
    /// transitions for a hit.
    pub fn observe(&mut self, observed: &BoundingBox, keep_new_frames: u32) {
        let (px, py) = self.bbox.center();
        let (ox, oy) = observed.center();
        self.velocity = (ox - px, oy - py);
        self.bbox = *observed;

        match self.state {
            TrackState::New => {
                self.new_frames += 1;
                if self.new_frames >= keep_new_frames {
                    self.state = TrackState::Tracked;
                    self.tracked_frames = 1;
                }
            }
            TrackState::Tracked => {
                self.tracked_frames += 1;
            }
            TrackState::Lost => {
                self.state = TrackState::Tracked;
                self.tracked_frames = 1;
                self.lost_frames = 0;
            }
            TrackState::Removed => {}
        }
    }

    /// Run the state transitions for a frame with no association.
    pub fn miss(&mut self, keep_lost_frames: u32) {
        match self.state {
            // A New track needs consecutive hits; one miss discards it.
            TrackState::New => self.state = TrackState::Removed,
            TrackState::Tracked => {
                self.state = TrackState::Lost;
                self.tracked_frames = 0;
                self.lost_frames = 1;
            }
            TrackState::Lost => {
                self.lost_frames += 1;
                if self.lost_frames > keep_lost_frames {
                    self.state = TrackState::Removed;
                }
            }
            TrackState::Removed => {}
        }
    }

    pub fn is_removed(&self) -> bool {
        self.state == TrackState::Removed
    }
}
