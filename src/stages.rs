//! Stage adapters wrapping the pluggable executors.
//!
//! Each adapter turns one executor call into a `Stage` so the graph can host
//! it on a worker thread. Executor failures on a single item skip that item;
//! warm-up failures are fatal.

use std::sync::{Arc, Mutex};

use crate::branch::{EmbeddedFace, FacePatchItem};
use crate::exec::{FaceAligner, FaceDetector, FaceEmbedder, OverlayRenderer};
use crate::frame::{Detection, Frame};
use crate::stage::{Stage, StageError};

fn lock_poisoned(role: &str) -> StageError {
    StageError::Fatal(anyhow::anyhow!("{role} executor lock poisoned"))
}

/// Runs the face detector and attaches its hits to the frame metadata.
pub struct DetectStage {
    detector: Arc<Mutex<dyn FaceDetector>>,
}

impl DetectStage {
    pub fn new(detector: Arc<Mutex<dyn FaceDetector>>) -> Self {
        Self { detector }
    }
}

impl Stage<Frame, Frame> for DetectStage {
    fn name(&self) -> &str {
        "detect"
    }

    fn warm_up(&mut self) -> Result<(), StageError> {
        let mut guard = self.detector.lock().map_err(|_| lock_poisoned("detector"))?;
        guard.warm_up().map_err(StageError::Fatal)
    }

    fn process(&mut self, mut frame: Frame) -> Result<Vec<Frame>, StageError> {
        let raw = {
            let mut guard = self.detector.lock().map_err(|_| lock_poisoned("detector"))?;
            guard
                .detect(frame.pixels(), frame.width(), frame.height(), frame.format())
                .map_err(StageError::Item)?
        };
        for hit in raw {
            let mut det = Detection::new(hit.bbox, hit.confidence, "face");
            det.landmarks = hit.landmarks;
            frame.meta.push_detection(det);
        }
        Ok(vec![frame])
    }
}

/// Normalizes cropped patches on the sub path.
pub struct AlignStage {
    aligner: Box<dyn FaceAligner>,
}

impl AlignStage {
    pub fn new(aligner: Box<dyn FaceAligner>) -> Self {
        Self { aligner }
    }
}

impl Stage<FacePatchItem, FacePatchItem> for AlignStage {
    fn name(&self) -> &str {
        "align"
    }

    fn process(&mut self, mut item: FacePatchItem) -> Result<Vec<FacePatchItem>, StageError> {
        self.aligner.align(&mut item.patch).map_err(StageError::Item)?;
        Ok(vec![item])
    }
}

/// Turns aligned patches into embeddings.
pub struct EmbedStage {
    embedder: Arc<Mutex<dyn FaceEmbedder>>,
}

impl EmbedStage {
    pub fn new(embedder: Arc<Mutex<dyn FaceEmbedder>>) -> Self {
        Self { embedder }
    }
}

impl Stage<FacePatchItem, EmbeddedFace> for EmbedStage {
    fn name(&self) -> &str {
        "embed"
    }

    fn warm_up(&mut self) -> Result<(), StageError> {
        let mut guard = self.embedder.lock().map_err(|_| lock_poisoned("embedder"))?;
        guard.warm_up().map_err(StageError::Fatal)
    }

    fn process(&mut self, item: FacePatchItem) -> Result<Vec<EmbeddedFace>, StageError> {
        let embedding = {
            let mut guard = self.embedder.lock().map_err(|_| lock_poisoned("embedder"))?;
            guard.embed(&item.patch).map_err(StageError::Item)?
        };
        Ok(vec![EmbeddedFace {
            key: item.key,
            track_id: item.track_id,
            embedding,
        }])
    }
}

/// Draws the enriched metadata back onto the frame for the sink.
pub struct OverlayStage {
    renderer: Box<dyn OverlayRenderer>,
}

impl OverlayStage {
    pub fn new(renderer: Box<dyn OverlayRenderer>) -> Self {
        Self { renderer }
    }
}

impl Stage<Frame, Frame> for OverlayStage {
    fn name(&self) -> &str {
        "overlay"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Vec<Frame>, StageError> {
        self.renderer.render(&mut frame).map_err(StageError::Item)?;
        Ok(vec![frame])
    }
}
