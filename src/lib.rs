//! facepipe
//!
//! Real-time face analytics pipeline core: a directed graph of processing
//! stages connected by bounded queues.
//!
//! # Architecture
//!
//! Frames flow through `source -> detect -> track -> split -> join -> hook
//! -> overlay -> sink`; the split fans every detection into a face sub-path
//! (`crop -> align -> embed -> match`) whose results the joiner reattaches
//! to the right detection on the right frame, whatever order they finish
//! in.
//!
//! The orchestration guarantees, in order of how much we lean on them:
//!
//! 1. **Bounded memory**: every link has a fixed capacity; backpressure is
//!    local (a slow stage throttles only its immediate upstream).
//! 2. **Per-frame correctness**: a frame is emitted downstream exactly once,
//!    and sub-results land on the detection named by their correlation key,
//!    never inferred from arrival order.
//! 3. **Clean cancellation**: a pipeline-wide stop wakes every blocked queue
//!    operation; no worker thread survives `stop`/`wait`.
//! 4. **Local error recovery**: per-item failures skip the item and are
//!    reported; only stage-fatal and startup errors take the pipeline down.
//!
//! # Module Structure
//!
//! - `frame`: frames, detections, embeddings, identity matches
//! - `queue`: bounded links, overflow policies, the stop token
//! - `stage`: the stage trait and its worker loop
//! - `branch`: the splitter/joiner pair and correlation bookkeeping
//! - `tracker`: multi-frame association and the track state machine
//! - `gallery`: identity store, persistence capability, matcher stage
//! - `graph`: builder, topology validation, pipeline lifecycle
//! - `exec`: pluggable executors (detector, cropper, aligner, embedder,
//!   overlay) behind trait seams, with deterministic stubs

pub mod branch;
pub mod config;
pub mod exec;
pub mod frame;
pub mod gallery;
pub mod graph;
pub mod hook;
pub mod monitor;
pub mod queue;
pub mod source;
pub mod stage;
pub mod stages;
pub mod tracker;

pub use branch::{CorrelationKey, EmbeddedFace, FacePatchItem, JoinerConfig, MatchedFace};
pub use config::{CorrelationSettings, FacepipeConfig, QueueSettings};
pub use exec::{
    ExecutorRegistry, FaceAligner, FaceCropper, FaceDetector, FaceEmbedder, OverlayRenderer,
    RawDetection, StubAligner, StubCropper, StubEmbedder, StubFaceDetector, StubOverlay,
};
pub use frame::{
    BoundingBox, Detection, Embedding, FacePatch, Frame, FrameMeta, IdentityMatch, Landmarks,
    PixelBuf, PixelFormat,
};
pub use gallery::{
    Gallery, GalleryConfig, GalleryEntry, GalleryStore, InMemoryGalleryStore, JsonGalleryStore,
    MatcherStage,
};
pub use graph::{assemble, GraphBuilder, Pipeline, PipelineParts, RunningPipeline};
pub use hook::{HookContext, InspectionHook, LogHook};
pub use monitor::{Monitor, PipelineEvent};
pub use queue::{OverflowPolicy, QueueSpec, StopToken, StopTrigger};
pub use source::{
    CountingSink, FrameSink, FrameSource, NullSink, SourceConfig, SyntheticSource,
};
pub use stage::{FatalReport, Stage, StageError};
pub use tracker::{Track, TrackState, Tracker, TrackerConfig, TrackerStage};
