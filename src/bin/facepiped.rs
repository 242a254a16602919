//! facepiped - face analytics pipeline daemon
//!
//! Runs the canonical pipeline end to end: a frame source feeds detection,
//! tracking, the face sub-path (crop/align/embed/match against the gallery)
//! and overlay rendering. Ships with deterministic stub executors; real
//! backends register through `ExecutorRegistry`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use facepipe::{
    assemble, ExecutorRegistry, FacepipeConfig, Gallery, GalleryStore, JsonGalleryStore, LogHook,
    NullSink, PipelineParts, StubAligner, StubCropper, StubEmbedder, StubFaceDetector,
    StubOverlay, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON config file (overrides FACEPIPE_CONFIG).
    #[arg(long)]
    config: Option<String>,
    /// Path to the JSON identity gallery. Missing or unreadable is fatal.
    #[arg(long, env = "FACEPIPE_GALLERY_PATH")]
    gallery: Option<String>,
    /// Stop after this many frames (0 runs until interrupted).
    #[arg(long, default_value_t = 0)]
    frame_limit: u64,
    /// Seconds between health log lines.
    #[arg(long, default_value_t = 10)]
    health_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("FACEPIPE_CONFIG", path);
    }
    let mut cfg = FacepipeConfig::load().context("loading configuration")?;
    if args.frame_limit > 0 {
        cfg.source.frame_limit = args.frame_limit;
    }
    if let Some(path) = &args.gallery {
        cfg.gallery.path = Some(path.into());
    }

    // Gallery load failure is startup-fatal.
    let gallery = match &cfg.gallery.path {
        Some(path) => {
            let store = JsonGalleryStore::new(path);
            let entries = store
                .load()
                .with_context(|| format!("loading gallery from {}", path.display()))?;
            log::info!("gallery: {} identities loaded from {}", entries.len(), path.display());
            Gallery::from_entries(cfg.gallery.queue_size, entries)
        }
        None => {
            log::warn!("no gallery configured; every face will be unmatched");
            Gallery::new(cfg.gallery.queue_size)
        }
    };

    let mut registry = ExecutorRegistry::new();
    registry.register_detector(StubFaceDetector::default());
    registry.register_embedder(StubEmbedder::new());

    let parts = PipelineParts {
        source: Box::new(SyntheticSource::new(cfg.source.clone())),
        detector: registry.default_detector()?,
        cropper: Box::new(StubCropper),
        aligner: Box::new(StubAligner),
        embedder: registry.default_embedder()?,
        gallery,
        hook: Box::new(LogHook),
        overlay: Box::new(StubOverlay),
        sink: Box::new(NullSink),
    };

    let (pipeline, monitor) = assemble(&cfg, parts)?;
    let running = pipeline.start();
    log::info!(
        "facepiped running: {}x{} @ {} fps, drain timeout {} ms",
        cfg.source.width,
        cfg.source.height,
        cfg.source.target_fps,
        cfg.drain_timeout_ms
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    let health_interval = Duration::from_secs(args.health_interval.max(1));
    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::SeqCst) && !running.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
        if last_health.elapsed() >= health_interval {
            log::info!(
                "health: matched={} skipped={} queue_drops={} correlation_timeouts={}",
                monitor.identities_matched(),
                monitor.items_skipped(),
                monitor.queue_drops(),
                monitor.correlation_timeouts()
            );
            last_health = Instant::now();
        }
    }

    let drain = Duration::from_millis(cfg.drain_timeout_ms);
    if shutdown.load(Ordering::SeqCst) {
        log::info!("interrupt received, draining");
        running.stop(drain)?;
    } else {
        running.wait()?;
    }

    log::info!(
        "done: {} identities matched, {} items skipped, {} correlation timeouts",
        monitor.identities_matched(),
        monitor.items_skipped(),
        monitor.correlation_timeouts()
    );
    Ok(())
}
