//! Pluggable executors for the model-backed and pixel-level steps.
//!
//! The pipeline graph never talks to an inference runtime directly; each
//! heavy step goes through one of these traits so real backends and test
//! stubs slot in interchangeably.

mod registry;
mod stubs;

pub use registry::ExecutorRegistry;
pub use stubs::{StubAligner, StubCropper, StubEmbedder, StubFaceDetector, StubOverlay};

use anyhow::Result;

use crate::frame::{BoundingBox, Embedding, FacePatch, Frame, Landmarks, PixelFormat};

/// A detector hit before it is attached to frame metadata.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Face detection backend.
///
/// Implementations must treat the pixel slice as read-only and ephemeral:
/// no copies retained past the call.
pub trait FaceDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, run once on the worker thread.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Extracts the face region of a frame into a standalone patch.
pub trait FaceCropper: Send {
    fn crop(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<FacePatch>;
}

/// Normalizes a face patch in place (rotation, landmark alignment).
pub trait FaceAligner: Send {
    fn align(&mut self, patch: &mut FacePatch) -> Result<()>;
}

/// Face embedding backend. Embeddings from one backend are only comparable
/// with embeddings from the same backend.
pub trait FaceEmbedder: Send {
    fn name(&self) -> &'static str;

    fn embed(&mut self, patch: &FacePatch) -> Result<Embedding>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Draws detection results onto a frame for downstream display or encoding.
pub trait OverlayRenderer: Send {
    fn render(&mut self, frame: &mut Frame) -> Result<()>;
}
