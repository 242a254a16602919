//! Inspection hook: the synchronous extension point between the joiner and
//! the overlay stage.
//!
//! The hook sees every fully enriched frame (detections, track ids,
//! embeddings, identity matches) and a context value that outlives
//! individual invocations. It sits on the single shared path, so anything
//! slow here stalls the whole downstream pipeline.

use std::collections::HashMap;

use crate::frame::Frame;
use crate::stage::{Stage, StageError};

/// Run-scoped state threaded through every hook invocation. Passed
/// explicitly rather than hidden in the hook's own fields so simple closure
/// hooks get counters for free.
#[derive(Debug, Default)]
pub struct HookContext {
    frames_seen: u64,
    identity_counts: HashMap<String, u64>,
}

impl HookContext {
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn identity_count(&self, label: &str) -> u64 {
        self.identity_counts.get(label).copied().unwrap_or(0)
    }

    pub fn identity_counts(&self) -> &HashMap<String, u64> {
        &self.identity_counts
    }
}

/// Frame observer. Receives an immutable frame; must return promptly.
pub trait InspectionHook: Send {
    fn inspect(&mut self, frame: &Frame, ctx: &mut HookContext);
}

impl<F> InspectionHook for F
where
    F: FnMut(&Frame, &mut HookContext) + Send,
{
    fn inspect(&mut self, frame: &Frame, ctx: &mut HookContext) {
        self(frame, ctx)
    }
}

/// Default hook: logs recognized identities as they appear.
#[derive(Default)]
pub struct LogHook;

impl InspectionHook for LogHook {
    fn inspect(&mut self, frame: &Frame, ctx: &mut HookContext) {
        for det in frame.meta.detections() {
            if let Some(identity) = &det.identity {
                // First sighting this run logs at info, repeats at debug.
                if ctx.identity_count(&identity.label) == 1 {
                    log::info!(
                        "recognized {} (similarity {:.2}) in frame {}",
                        identity.label,
                        identity.similarity,
                        frame.id()
                    );
                } else {
                    log::debug!(
                        "recognized {} again in frame {}",
                        identity.label,
                        frame.id()
                    );
                }
            }
        }
    }
}

/// Hosts the hook on the shared path. Updates the context counters before
/// invoking the hook so the hook observes the frame already counted.
pub struct HookStage {
    hook: Box<dyn InspectionHook>,
    ctx: HookContext,
}

impl HookStage {
    pub fn new(hook: Box<dyn InspectionHook>) -> Self {
        Self {
            hook,
            ctx: HookContext::default(),
        }
    }
}

impl Stage<Frame, Frame> for HookStage {
    fn name(&self) -> &str {
        "hook"
    }

    fn process(&mut self, frame: Frame) -> Result<Vec<Frame>, StageError> {
        self.ctx.frames_seen += 1;
        for det in frame.meta.detections() {
            if let Some(identity) = &det.identity {
                *self
                    .ctx
                    .identity_counts
                    .entry(identity.label.clone())
                    .or_insert(0) += 1;
            }
        }
        self.hook.inspect(&frame, &mut self.ctx);
        Ok(vec![frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection, IdentityMatch, PixelBuf, PixelFormat};

    fn enriched_frame(id: u64, label: Option<&str>) -> Frame {
        let buf = PixelBuf::new(vec![0u8; 16], 4, 4, PixelFormat::Gray8);
        let mut frame = Frame::new(id, 0, buf);
        let mut det = Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 0.9, "face");
        det.identity = label.map(|l| IdentityMatch {
            label: l.to_string(),
            similarity: 0.8,
        });
        frame.meta.push_detection(det);
        frame
    }

    #[test]
    fn context_counts_frames_and_identities() {
        let mut stage = HookStage::new(Box::new(LogHook));
        stage.process(enriched_frame(1, Some("alice"))).unwrap();
        stage.process(enriched_frame(2, None)).unwrap();
        stage.process(enriched_frame(3, Some("alice"))).unwrap();

        assert_eq!(stage.ctx.frames_seen(), 3);
        assert_eq!(stage.ctx.identity_count("alice"), 2);
        assert_eq!(stage.ctx.identity_count("bob"), 0);
    }

    #[test]
    fn closure_hooks_observe_every_frame() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_in_hook = seen.clone();
        let mut stage = HookStage::new(Box::new(move |_: &Frame, ctx: &mut HookContext| {
            seen_in_hook.store(ctx.frames_seen(), std::sync::atomic::Ordering::SeqCst);
        }));

        stage.process(enriched_frame(1, None)).unwrap();
        stage.process(enriched_frame(2, None)).unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn hook_passes_frame_through_unchanged() {
        let mut stage = HookStage::new(Box::new(LogHook));
        let out = stage.process(enriched_frame(7, Some("alice"))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), 7);
        assert_eq!(out[0].meta.len(), 1);
    }
}
