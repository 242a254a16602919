//! Pipeline graph assembly and lifecycle.
//!
//! A `GraphBuilder` wires stages together over typed bounded links, checks
//! the topology (every splitter needs its joiner), and produces a `Pipeline`
//! that can be started once. The running pipeline owns every worker thread;
//! `stop` drains in two phases (close intake, then hard-stop whatever is
//! left after the drain timeout) and `wait` blocks until the stream ends on
//! its own. Either way, no worker thread survives the call.

use std::collections::BTreeSet;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;

use crate::branch::{
    spawn_joiner, spawn_splitter, FacePatchItem, JoinerConfig, MatchedFace, SplitFrame,
};
use crate::config::FacepipeConfig;
use crate::exec::{FaceAligner, FaceCropper, FaceDetector, FaceEmbedder, OverlayRenderer};
use crate::frame::Frame;
use crate::gallery::{Gallery, MatcherStage};
use crate::hook::{HookStage, InspectionHook};
use crate::monitor::Monitor;
use crate::queue::{
    link, stop_channel, LinkReceiver, LinkSender, QueueSpec, StopToken, StopTrigger,
};
use crate::source::{spawn_sink, spawn_source, FrameSink, FrameSource};
use crate::stage::{spawn_stage, FatalReport, Stage};
use crate::stages::{AlignStage, DetectStage, EmbedStage, OverlayStage};
use crate::tracker::TrackerStage;

use std::sync::{Arc, Mutex};

struct Worker {
    name: String,
    spawn: Box<dyn FnOnce() -> JoinHandle<()> + Send>,
}

/// Assembles a pipeline. Links created through the builder share its stop
/// token and monitor, so a pipeline-wide stop wakes every blocked queue
/// operation.
pub struct GraphBuilder {
    stop: StopTrigger,
    stop_token: StopToken,
    /// Fired first on shutdown; only the source watches it, so in-flight
    /// frames drain through the rest of the graph.
    intake: StopTrigger,
    intake_token: StopToken,
    monitor: Monitor,
    fatal_tx: crossbeam_channel::Sender<FatalReport>,
    fatal_rx: Receiver<FatalReport>,
    workers: Vec<Worker>,
    splits: BTreeSet<String>,
    joins: BTreeSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        let (stop, stop_token) = stop_channel();
        let (intake, intake_token) = stop_channel();
        let (fatal_tx, fatal_rx) = crossbeam_channel::unbounded();
        Self {
            stop,
            stop_token,
            intake,
            intake_token,
            monitor: Monitor::new(),
            fatal_tx,
            fatal_rx,
            workers: Vec::new(),
            splits: BTreeSet::new(),
            joins: BTreeSet::new(),
        }
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor.clone()
    }

    /// Create a named bounded link wired to this graph's stop token.
    pub fn link<T>(&self, name: &str, spec: QueueSpec) -> (LinkSender<T>, LinkReceiver<T>) {
        link(name, spec, self.stop_token.clone(), self.monitor.clone())
    }

    pub fn add_stage<I, O, S>(&mut self, stage: S, input: LinkReceiver<I>, output: LinkSender<O>)
    where
        I: Send + 'static,
        O: Send + 'static,
        S: Stage<I, O> + 'static,
    {
        let name = stage.name().to_string();
        let stop = self.stop.clone();
        let fatal_tx = self.fatal_tx.clone();
        let monitor = self.monitor.clone();
        self.workers.push(Worker {
            name,
            spawn: Box::new(move || spawn_stage(stage, input, output, stop, fatal_tx, monitor)),
        });
    }

    pub fn add_source(
        &mut self,
        source: Box<dyn FrameSource>,
        output: LinkSender<Frame>,
        target_fps: u32,
    ) {
        let intake_token = self.intake_token.clone();
        let fatal_tx = self.fatal_tx.clone();
        self.workers.push(Worker {
            name: "source".into(),
            spawn: Box::new(move || {
                spawn_source(source, output, intake_token, fatal_tx, target_fps)
            }),
        });
    }

    pub fn add_sink(&mut self, sink: Box<dyn FrameSink>, input: LinkReceiver<Frame>) {
        self.workers.push(Worker {
            name: "sink".into(),
            spawn: Box::new(move || spawn_sink(sink, input)),
        });
    }

    pub fn add_splitter(
        &mut self,
        name: &str,
        cropper: Box<dyn FaceCropper>,
        input: LinkReceiver<Frame>,
        primary: LinkSender<SplitFrame>,
        sub: LinkSender<FacePatchItem>,
    ) {
        self.splits.insert(name.to_string());
        let monitor = self.monitor.clone();
        self.workers.push(Worker {
            name: format!("splitter:{name}"),
            spawn: Box::new(move || spawn_splitter(cropper, input, primary, sub, monitor)),
        });
    }

    pub fn add_joiner(
        &mut self,
        name: &str,
        cfg: JoinerConfig,
        primary: LinkReceiver<SplitFrame>,
        sub: LinkReceiver<MatchedFace>,
        output: LinkSender<Frame>,
    ) {
        self.joins.insert(name.to_string());
        let stop_token = self.stop_token.clone();
        let monitor = self.monitor.clone();
        self.workers.push(Worker {
            name: format!("joiner:{name}"),
            spawn: Box::new(move || spawn_joiner(cfg, primary, sub, output, stop_token, monitor)),
        });
    }

    /// Validate the topology and seal the graph.
    pub fn build(self) -> Result<Pipeline> {
        if let Some(name) = self.splits.difference(&self.joins).next() {
            return Err(anyhow!("splitter '{}' has no matching joiner", name));
        }
        if let Some(name) = self.joins.difference(&self.splits).next() {
            return Err(anyhow!("joiner '{}' has no matching splitter", name));
        }
        if self.workers.is_empty() {
            return Err(anyhow!("pipeline graph has no stages"));
        }
        Ok(Pipeline {
            stop: self.stop,
            intake: self.intake,
            monitor: self.monitor,
            fatal_rx: self.fatal_rx,
            workers: self.workers,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, not-yet-running graph.
pub struct Pipeline {
    stop: StopTrigger,
    intake: StopTrigger,
    monitor: Monitor,
    fatal_rx: Receiver<FatalReport>,
    workers: Vec<Worker>,
}

impl Pipeline {
    /// Spawn every worker thread.
    pub fn start(self) -> RunningPipeline {
        let handles = self
            .workers
            .into_iter()
            .map(|w| {
                log::debug!("starting worker {}", w.name);
                (w.name, (w.spawn)())
            })
            .collect();
        RunningPipeline {
            stop: self.stop,
            intake: self.intake,
            monitor: self.monitor,
            fatal_rx: self.fatal_rx,
            handles,
        }
    }
}

/// Handle to a started pipeline. Consuming `stop` or `wait` is the only way
/// to give the threads back.
pub struct RunningPipeline {
    stop: StopTrigger,
    intake: StopTrigger,
    monitor: Monitor,
    fatal_rx: Receiver<FatalReport>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl RunningPipeline {
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// True once every worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|(_, h)| h.is_finished())
    }

    /// Non-blocking check for a stage-fatal error.
    pub fn try_fatal(&self) -> Option<FatalReport> {
        self.fatal_rx.try_recv().ok()
    }

    /// Two-phase shutdown: close intake and let in-flight frames drain for
    /// up to `drain_timeout`, then hard-stop whatever is still running and
    /// join every thread.
    pub fn stop(mut self, drain_timeout: Duration) -> Result<()> {
        log::info!("pipeline stopping (drain timeout {:?})", drain_timeout);
        self.intake.fire();
        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline && !self.is_finished() {
            thread::sleep(Duration::from_millis(10));
        }
        if !self.is_finished() {
            log::warn!("drain timeout expired; discarding in-flight frames");
        }
        self.stop.fire();
        self.join_all()
    }

    /// Block until the stream ends on its own (source end-of-stream or a
    /// fatal error), then join every thread.
    pub fn wait(mut self) -> Result<()> {
        self.join_all()
    }

    fn join_all(&mut self) -> Result<()> {
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("worker {name} panicked");
            }
        }
        if let Ok(fatal) = self.fatal_rx.try_recv() {
            return Err(fatal
                .error
                .context(format!("stage '{}' failed fatally", fatal.stage)));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Canonical face pipeline
// ----------------------------------------------------------------------------

/// Everything the canonical topology needs plugged in.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Arc<Mutex<dyn FaceDetector>>,
    pub cropper: Box<dyn FaceCropper>,
    pub aligner: Box<dyn FaceAligner>,
    pub embedder: Arc<Mutex<dyn FaceEmbedder>>,
    pub gallery: Gallery,
    pub hook: Box<dyn InspectionHook>,
    pub overlay: Box<dyn OverlayRenderer>,
    pub sink: Box<dyn FrameSink>,
}

/// Build the full face pipeline:
///
/// ```text
/// source > detect > tracker > split +-(primary)------------------+
///                                   +-(sub) align > embed > match+ > join > hook > overlay > sink
/// ```
pub fn assemble(cfg: &FacepipeConfig, parts: PipelineParts) -> Result<(Pipeline, Monitor)> {
    cfg.validate().context("invalid pipeline configuration")?;
    let mut builder = GraphBuilder::new();
    let monitor = builder.monitor();

    let q = |name: &str| cfg.queues.spec_for(name);

    let (src_tx, src_rx) = builder.link::<Frame>("pre_detect_q", q("pre_detect_q"));
    let (det_tx, det_rx) = builder.link::<Frame>("pre_tracker_q", q("pre_tracker_q"));
    let (trk_tx, trk_rx) = builder.link::<Frame>("pre_split_q", q("pre_split_q"));
    let (primary_tx, primary_rx) = builder.link::<SplitFrame>("primary_q", q("primary_q"));
    let (crop_tx, crop_rx) = builder.link::<FacePatchItem>("face_align_q", q("face_align_q"));
    let (align_tx, align_rx) = builder.link::<FacePatchItem>("face_embed_q", q("face_embed_q"));
    let (embed_tx, embed_rx) = builder.link::<crate::branch::EmbeddedFace>("face_match_q", q("face_match_q"));
    let (match_tx, match_rx) = builder.link::<MatchedFace>("merge_q", q("merge_q"));
    let (join_tx, join_rx) = builder.link::<Frame>("hook_q", q("hook_q"));
    let (hook_tx, hook_rx) = builder.link::<Frame>("overlay_q", q("overlay_q"));
    let (ovl_tx, ovl_rx) = builder.link::<Frame>("display_q", q("display_q"));

    builder.add_source(parts.source, src_tx, cfg.source.target_fps);
    builder.add_stage(DetectStage::new(parts.detector), src_rx, det_tx);
    builder.add_stage(TrackerStage::new(cfg.tracker), det_rx, trk_tx);
    builder.add_splitter("face", parts.cropper, trk_rx, primary_tx, crop_tx);
    builder.add_stage(AlignStage::new(parts.aligner), crop_rx, align_tx);
    builder.add_stage(EmbedStage::new(parts.embedder), align_rx, embed_tx);
    builder.add_stage(
        MatcherStage::new(parts.gallery, cfg.gallery.similarity_thr, monitor.clone()),
        embed_rx,
        match_tx,
    );
    builder.add_joiner(
        "face",
        JoinerConfig {
            timeout: Duration::from_millis(cfg.correlation.timeout_ms),
            max_pending_frames: cfg.correlation.max_pending_frames,
            keep_past_metadata: cfg.tracker.keep_past_metadata,
        },
        primary_rx,
        match_rx,
        join_tx,
    );
    builder.add_stage(HookStage::new(parts.hook), join_rx, hook_tx);
    builder.add_stage(OverlayStage::new(parts.overlay), hook_rx, ovl_tx);
    builder.add_sink(parts.sink, ovl_rx);

    Ok((builder.build()?, monitor))
}
