//! Stub executors for testing and synthetic runs.
//!
//! The detector finds the bounding box of bright pixels, the embedder hashes
//! patch bytes into a deterministic vector. Identical patches therefore map
//! to identical embeddings, which is what the gallery tests rely on.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::frame::{BoundingBox, Embedding, FacePatch, Frame, PixelBuf, PixelFormat};

use super::{FaceAligner, FaceCropper, FaceDetector, FaceEmbedder, OverlayRenderer, RawDetection};

// ---- detector ----

/// Finds the axis-aligned bounding box of pixels brighter than a threshold
/// (first channel only) and reports it as one detection.
pub struct StubFaceDetector {
    threshold: u8,
}

impl StubFaceDetector {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl Default for StubFaceDetector {
    fn default() -> Self {
        Self::new(200)
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Vec<RawDetection>> {
        let bpp = format.bytes_per_pixel();
        let stride = width as usize * bpp;
        if pixels.len() < stride * height as usize {
            return Err(anyhow!(
                "pixel buffer too short: {} < {}",
                pixels.len(),
                stride * height as usize
            ));
        }

        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut bright = 0u64;
        for y in 0..height {
            let row = &pixels[y as usize * stride..(y as usize + 1) * stride];
            for x in 0..width {
                if row[x as usize * bpp] > self.threshold {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                    bright += 1;
                }
            }
        }

        if bright == 0 {
            return Ok(vec![]);
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x - min_x + 1) as f32,
            (max_y - min_y + 1) as f32,
        );
        // Confidence scales with how solid the bright region is.
        let confidence = (bright as f32 / bbox.area()).clamp(0.0, 1.0);
        Ok(vec![RawDetection {
            bbox,
            confidence,
            landmarks: None,
        }])
    }
}

// ---- cropper ----

/// Row-copy crop of the clamped detection box.
#[derive(Default)]
pub struct StubCropper;

impl FaceCropper for StubCropper {
    fn crop(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<FacePatch> {
        let clamped = bbox
            .clamped(frame.width(), frame.height())
            .ok_or_else(|| anyhow!("detection box lies outside the frame"))?;

        let x = clamped.x as u32;
        let y = clamped.y as u32;
        let w = (clamped.w as u32).max(1);
        let h = (clamped.h as u32).max(1);

        let bpp = frame.format().bytes_per_pixel();
        let stride = frame.width() as usize * bpp;
        let pixels = frame.pixels();

        let mut data = Vec::with_capacity(w as usize * h as usize * bpp);
        for row in y..y + h {
            let start = row as usize * stride + x as usize * bpp;
            data.extend_from_slice(&pixels[start..start + w as usize * bpp]);
        }

        Ok(FacePatch {
            buf: PixelBuf::new(data, w, h, frame.format()),
            landmarks: None,
        })
    }
}

// ---- aligner ----

/// Pass-through aligner. Real alignment needs landmarks from a landmark
/// detector; the stub pipeline produces none.
#[derive(Default)]
pub struct StubAligner;

impl FaceAligner for StubAligner {
    fn align(&mut self, _patch: &mut FacePatch) -> Result<()> {
        Ok(())
    }
}

// ---- embedder ----

pub const STUB_EMBEDDING_DIM: usize = 128;

/// Deterministic embedder: expands a SHA-256 digest of the patch bytes into
/// a fixed-dimension vector. Equal patches embed identically; unrelated
/// patches land near-orthogonal.
#[derive(Default)]
pub struct StubEmbedder;

impl StubEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl FaceEmbedder for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn embed(&mut self, patch: &FacePatch) -> Result<Embedding> {
        let digest: [u8; 32] = Sha256::digest(patch.buf.pixels()).into();
        let mut values = Vec::with_capacity(STUB_EMBEDDING_DIM);
        let mut block = digest;
        while values.len() < STUB_EMBEDDING_DIM {
            for byte in block {
                if values.len() == STUB_EMBEDDING_DIM {
                    break;
                }
                values.push((byte as f32 - 127.5) / 127.5);
            }
            block = Sha256::digest(block).into();
        }
        Ok(Embedding::new(values))
    }
}

// ---- overlay ----

/// Draws a one-pixel box outline per detection, brightness keyed to whether
/// the detection carries a matched identity.
#[derive(Default)]
pub struct StubOverlay;

impl OverlayRenderer for StubOverlay {
    fn render(&mut self, frame: &mut Frame) -> Result<()> {
        let width = frame.width();
        let height = frame.height();
        let bpp = frame.format().bytes_per_pixel();
        let stride = width as usize * bpp;

        let boxes: Vec<(BoundingBox, bool)> = frame
            .meta
            .detections()
            .iter()
            .filter_map(|d| {
                d.bbox
                    .clamped(width, height)
                    .map(|b| (b, d.identity.is_some()))
            })
            .collect();

        let pixels = frame.pixels_mut();
        for (bbox, matched) in boxes {
            let value = if matched { 255 } else { 160 };
            let x1 = bbox.x as usize;
            let y1 = bbox.y as usize;
            let x2 = (bbox.x + bbox.w) as usize - 1;
            let y2 = (bbox.y + bbox.h) as usize - 1;
            for x in x1..=x2 {
                pixels[y1 * stride + x * bpp] = value;
                pixels[y2 * stride + x * bpp] = value;
            }
            for y in y1..=y2 {
                pixels[y * stride + x1 * bpp] = value;
                pixels[y * stride + x2 * bpp] = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Detection;

    fn frame_with_square(x: u32, y: u32, side: u32) -> Frame {
        let (w, h) = (64u32, 48u32);
        let mut data = vec![0u8; (w * h) as usize];
        for row in y..y + side {
            for col in x..x + side {
                data[(row * w + col) as usize] = 255;
            }
        }
        Frame::new(0, 0, PixelBuf::new(data, w, h, PixelFormat::Gray8))
    }

    #[test]
    fn detector_finds_bright_square() {
        let frame = frame_with_square(10, 12, 8);
        let mut det = StubFaceDetector::default();
        let hits = det
            .detect(frame.pixels(), frame.width(), frame.height(), frame.format())
            .unwrap();
        assert_eq!(hits.len(), 1);
        let bbox = &hits[0].bbox;
        assert_eq!((bbox.x, bbox.y, bbox.w, bbox.h), (10.0, 12.0, 8.0, 8.0));
        assert!(hits[0].confidence > 0.99);
    }

    #[test]
    fn detector_reports_nothing_on_dark_frame() {
        let data = vec![10u8; 64 * 48];
        let frame = Frame::new(0, 0, PixelBuf::new(data, 64, 48, PixelFormat::Gray8));
        let mut det = StubFaceDetector::default();
        let hits = det
            .detect(frame.pixels(), frame.width(), frame.height(), frame.format())
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn crop_extracts_exact_region() {
        let frame = frame_with_square(10, 12, 8);
        let mut cropper = StubCropper;
        let patch = cropper
            .crop(&frame, &BoundingBox::new(10.0, 12.0, 8.0, 8.0))
            .unwrap();
        assert_eq!(patch.buf.byte_len(), 64);
        assert!(patch.buf.pixels().iter().all(|&p| p == 255));
    }

    #[test]
    fn crop_rejects_box_outside_frame() {
        let frame = frame_with_square(10, 12, 8);
        let mut cropper = StubCropper;
        assert!(cropper
            .crop(&frame, &BoundingBox::new(-50.0, -50.0, 10.0, 10.0))
            .is_err());
    }

    #[test]
    fn identical_patches_embed_identically() {
        let frame = frame_with_square(10, 12, 8);
        let mut cropper = StubCropper;
        let bbox = BoundingBox::new(10.0, 12.0, 8.0, 8.0);
        let a = cropper.crop(&frame, &bbox).unwrap();
        let b = cropper.crop(&frame, &bbox).unwrap();

        let mut embedder = StubEmbedder::new();
        let ea = embedder.embed(&a).unwrap();
        let eb = embedder.embed(&b).unwrap();
        assert_eq!(ea.dim(), STUB_EMBEDDING_DIM);
        assert!((ea.cosine_similarity(&eb) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn different_patches_embed_dissimilarly() {
        let mut cropper = StubCropper;
        let fa = frame_with_square(10, 12, 8);
        let fb = frame_with_square(30, 20, 8);
        // The dark column sits on opposite edges, so the patch bytes differ.
        let pa = cropper.crop(&fa, &BoundingBox::new(9.0, 12.0, 9.0, 8.0)).unwrap();
        let pb = cropper.crop(&fb, &BoundingBox::new(30.0, 20.0, 9.0, 8.0)).unwrap();

        let mut embedder = StubEmbedder::new();
        let ea = embedder.embed(&pa).unwrap();
        let eb = embedder.embed(&pb).unwrap();
        assert!(ea.cosine_similarity(&eb) < 0.4);
    }

    #[test]
    fn overlay_draws_box_edges() {
        let mut frame = frame_with_square(10, 12, 8);
        frame
            .meta
            .push_detection(Detection::new(BoundingBox::new(2.0, 2.0, 6.0, 6.0), 0.9, "face"));
        let mut overlay = StubOverlay;
        overlay.render(&mut frame).unwrap();
        // Corner of the outline.
        assert_eq!(frame.pixels()[2 * 64 + 2], 160);
    }
}
