//! Frame sources and sinks at the edges of the graph.
//!
//! Capture and display are external collaborators; the pipeline only sees a
//! producer feeding the first link and a consumer draining the last one. The
//! synthetic source exists for tests and `stub://` daemon runs.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, PixelBuf, PixelFormat};
use crate::queue::{LinkRecvError, LinkReceiver, LinkSender, StopToken};
use crate::stage::FatalReport;

/// Produces the raw frame sequence. `None` is a clean end of stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Consumes the final overlay-rendered stream.
pub trait FrameSink: Send {
    fn consume(&mut self, frame: Frame) -> Result<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    /// 0 means free-running (no pacing sleep).
    pub target_fps: u32,
    /// Synthetic source stops after this many frames; 0 means unbounded.
    pub frame_limit: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
            frame_limit: 0,
        }
    }
}

fn frame_interval(target_fps: u32) -> Option<Duration> {
    if target_fps == 0 {
        None
    } else {
        Some(Duration::from_millis((1000 / target_fps).max(1) as u64))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source
// ----------------------------------------------------------------------------

const SQUARE_SIDE: u32 = 32;

/// Deterministic grayscale scene: a white square sliding one pixel per frame
/// across a dark background. The stub detector picks it up, and because the
/// square's pixels never change, its crops embed identically frame after
/// frame.
pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.config.frame_limit > 0 && self.frame_count >= self.config.frame_limit {
            return Ok(None);
        }
        let (w, h) = (self.config.width, self.config.height);
        let mut data = vec![16u8; (w * h) as usize];

        // Keep the square fully inside the frame while it slides. Frames
        // smaller than the square get a truncated square.
        let range = w.saturating_sub(SQUARE_SIDE + 2).max(1) as u64;
        let x = (1 + (self.frame_count % range) as u32).min(w.saturating_sub(1));
        let y = h / 4;
        for row in y..y + SQUARE_SIDE.min(h.saturating_sub(y)) {
            for col in x..x + SQUARE_SIDE.min(w.saturating_sub(x)) {
                data[(row * w + col) as usize] = 255;
            }
        }

        self.frame_count += 1;
        Ok(Some(Frame::new(
            self.frame_count,
            Frame::now_micros(),
            PixelBuf::new(data, w, h, PixelFormat::Gray8),
        )))
    }
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// Discards frames; stands in for a display in headless runs.
#[derive(Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn consume(&mut self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Records what reached the end of the graph; test observability.
pub struct CountingSink {
    tx: Sender<Frame>,
}

impl CountingSink {
    /// Returns the sink and the receiver its frames land on.
    pub fn new() -> (Self, crossbeam_channel::Receiver<Frame>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl FrameSink for CountingSink {
    fn consume(&mut self, frame: Frame) -> Result<()> {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.tx.send(frame);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Edge workers
// ----------------------------------------------------------------------------

/// Drive a source into the first link, paced to `target_fps`.
///
/// Exits on end of stream (dropping the sender so the graph drains), on
/// stop, or on a source error, which is fatal: capture failing is not a
/// per-item condition the pipeline can skip past.
pub fn spawn_source(
    mut source: Box<dyn FrameSource>,
    output: LinkSender<Frame>,
    stop: StopToken,
    fatal_tx: Sender<FatalReport>,
    target_fps: u32,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("source".into())
        .spawn(move || {
            let interval = frame_interval(target_fps);
            loop {
                if stop.is_stopped() {
                    return;
                }
                let frame = match source.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        log::info!("source: end of stream");
                        return;
                    }
                    Err(e) => {
                        log::error!("source: {e:#}");
                        let _ = fatal_tx.send(FatalReport {
                            stage: "source".into(),
                            error: e,
                        });
                        return;
                    }
                };
                if output.send(frame).is_err() {
                    return;
                }
                if let Some(interval) = interval {
                    if stop.wait_timeout(interval) {
                        return;
                    }
                }
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn source thread: {e}"))
}

/// Drain the last link into a sink. Sink errors are logged and the frame
/// dropped; the display going away should not kill analysis.
pub fn spawn_sink(
    mut sink: Box<dyn FrameSink>,
    input: LinkReceiver<Frame>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sink".into())
        .spawn(move || loop {
            match input.recv() {
                Ok(frame) => {
                    if let Err(e) = sink.consume(frame) {
                        log::warn!("sink: {e:#}");
                    }
                }
                Err(LinkRecvError::Closed) | Err(LinkRecvError::Stopped) => return,
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn sink thread: {e}"))
}
