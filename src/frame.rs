//! Frame and per-frame metadata model.
//!
//! A `Frame` owns its pixel buffer exclusively; the buffer moves through the
//! graph with the frame and is zeroized when the frame is dropped, so frames
//! evicted from a leaky queue release their memory deterministically.
//!
//! Metadata (`FrameMeta`) is append-only: stages attach detections, track
//! ids, embeddings and identity matches, but never remove or reorder what an
//! earlier stage attached. Exactly one stage holds a frame at a time, so no
//! locking is needed on the metadata itself.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

// ----------------------------------------------------------------------------
// Pixel buffers
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Owned pixel data. Zeroized on drop.
#[derive(Debug)]
pub struct PixelBuf {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl PixelBuf {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * format.bytes_per_pixel()
        );
        Self {
            data,
            width,
            height,
            format,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl Drop for PixelBuf {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

// ----------------------------------------------------------------------------
// Geometry
// ----------------------------------------------------------------------------

/// Axis-aligned box in pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Intersection-over-union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Euclidean distance between box centers.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Clamp the box to frame bounds, returning None when nothing remains.
    pub fn clamped(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.w).min(width as f32);
        let y2 = (self.y + self.h).min(height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some(BoundingBox::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Landmark points (eyes, nose, mouth corners) in pixel space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmarks(pub Vec<(f32, f32)>);

// ----------------------------------------------------------------------------
// Embeddings and identity
// ----------------------------------------------------------------------------

/// Fixed-length feature vector produced by the recognition executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity in [-1, 1]. Returns 0.0 on dimension mismatch or a
    /// zero vector, so a degenerate embedding can never claim a match.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut na = 0.0f32;
        let mut nb = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            na += a * a;
            nb += b * b;
        }
        if na <= 0.0 || nb <= 0.0 {
            return 0.0;
        }
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Identity attached to a detection by the gallery matcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub label: String,
    pub similarity: f32,
}

// ----------------------------------------------------------------------------
// Detections
// ----------------------------------------------------------------------------

/// One detected object. Owned by exactly one frame's metadata set; later
/// stages fill in the optional fields, earlier fields are never rewritten.
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub class_label: String,
    pub landmarks: Option<Landmarks>,
    /// Weak reference to a tracker-owned track, by id only.
    pub track_id: Option<u64>,
    pub embedding: Option<Embedding>,
    pub identity: Option<IdentityMatch>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            class_label: class_label.into(),
            landmarks: None,
            track_id: None,
            embedding: None,
            identity: None,
        }
    }
}

/// Append-only metadata set attached to a frame.
#[derive(Debug, Default)]
pub struct FrameMeta {
    detections: Vec<Detection>,
}

impl FrameMeta {
    pub fn push_detection(&mut self, det: Detection) {
        self.detections.push(det);
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn detections_mut(&mut self) -> &mut [Detection] {
        &mut self.detections
    }

    pub fn detection_mut(&mut self, index: usize) -> Option<&mut Detection> {
        self.detections.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One video frame moving through the graph.
///
/// Core fields (id, timestamp, buffer dimensions) are fixed at capture; only
/// the metadata set and, in the overlay stage, the pixel contents change.
#[derive(Debug)]
pub struct Frame {
    id: u64,
    ts_micros: u64,
    buf: PixelBuf,
    pub meta: FrameMeta,
}

impl Frame {
    pub fn new(id: u64, ts_micros: u64, buf: PixelBuf) -> Self {
        Self {
            id,
            ts_micros,
            buf,
            meta: FrameMeta::default(),
        }
    }

    /// Capture timestamp in microseconds since the epoch, best effort.
    pub fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ts_micros(&self) -> u64 {
        self.ts_micros
    }

    pub fn width(&self) -> u32 {
        self.buf.width
    }

    pub fn height(&self) -> u32 {
        self.buf.height
    }

    pub fn format(&self) -> PixelFormat {
        self.buf.format
    }

    pub fn pixels(&self) -> &[u8] {
        self.buf.pixels()
    }

    /// Mutable pixel access for the overlay render pass. The renderer owns
    /// the frame exclusively at that point, like any other stage.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.buf.pixels_mut()
    }

    pub fn byte_len(&self) -> usize {
        self.buf.byte_len()
    }
}

/// A cropped (and later aligned) face region derived from one detection.
#[derive(Debug)]
pub struct FacePatch {
    pub buf: PixelBuf,
    pub landmarks: Option<Landmarks>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(10.0, 10.0, 50.0, 40.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(100.0, 100.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn clamped_drops_out_of_frame_boxes() {
        let b = BoundingBox::new(700.0, 500.0, 20.0, 20.0);
        assert!(b.clamped(640, 480).is_none());

        let partial = BoundingBox::new(-5.0, -5.0, 20.0, 20.0);
        let clamped = partial.clamped(640, 480).expect("clamp");
        assert_eq!(clamped.x, 0.0);
        assert_eq!(clamped.y, 0.0);
        assert_eq!(clamped.w, 15.0);
    }

    #[test]
    fn cosine_similarity_is_one_for_equal_vectors() {
        let a = Embedding::new(vec![0.5, 0.2, -0.1]);
        assert!((a.cosine_similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_rejects_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn metadata_is_append_only() {
        let buf = PixelBuf::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb8);
        let mut frame = Frame::new(1, 0, buf);
        frame.meta.push_detection(Detection::new(
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            0.9,
            "face",
        ));
        frame.meta.push_detection(Detection::new(
            BoundingBox::new(1.0, 1.0, 1.0, 1.0),
            0.8,
            "face",
        ));
        assert_eq!(frame.meta.len(), 2);
        assert_eq!(frame.meta.detections()[0].confidence, 0.9);
    }
}
