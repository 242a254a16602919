//! Daemon and pipeline configuration.
//!
//! Layered the usual way: built-in defaults, then an optional JSON file
//! named by `FACEPIPE_CONFIG`, then `FACEPIPE_*` environment overrides,
//! then validation. Library users can also construct `FacepipeConfig`
//! directly and skip the file entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::gallery::GalleryConfig;
use crate::queue::{OverflowPolicy, QueueSpec};
use crate::source::SourceConfig;
use crate::tracker::TrackerConfig;

const DEFAULT_QUEUE_CAPACITY: usize = 30;
const DEFAULT_CORRELATION_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_PENDING_FRAMES: usize = 64;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FacepipeConfigFile {
    source: Option<SourceConfig>,
    queues: Option<QueueSettings>,
    tracker: Option<TrackerConfig>,
    gallery: Option<GalleryConfig>,
    correlation: Option<CorrelationSettings>,
    drain_timeout_ms: Option<u64>,
}

/// Queue sizing: one default, overridable per named link.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub default_capacity: usize,
    pub default_policy: OverflowPolicy,
    pub overrides: HashMap<String, LinkOverride>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkOverride {
    pub capacity: Option<usize>,
    pub policy: Option<OverflowPolicy>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_QUEUE_CAPACITY,
            default_policy: OverflowPolicy::Block,
            overrides: HashMap::new(),
        }
    }
}

impl QueueSettings {
    pub fn spec_for(&self, link: &str) -> QueueSpec {
        let over = self.overrides.get(link);
        QueueSpec {
            capacity: over
                .and_then(|o| o.capacity)
                .unwrap_or(self.default_capacity),
            policy: over.and_then(|o| o.policy).unwrap_or(self.default_policy),
        }
    }
}

/// Joiner bounds for the split/join pair.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationSettings {
    pub timeout_ms: u64,
    pub max_pending_frames: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_CORRELATION_TIMEOUT_MS,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FacepipeConfig {
    pub source: SourceConfig,
    pub queues: QueueSettings,
    pub tracker: TrackerConfig,
    pub gallery: GalleryConfig,
    pub correlation: CorrelationSettings,
    pub drain_timeout_ms: u64,
}

impl Default for FacepipeConfig {
    fn default() -> Self {
        Self::from_file(FacepipeConfigFile::default())
    }
}

impl FacepipeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACEPIPE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => FacepipeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacepipeConfigFile) -> Self {
        Self {
            source: file.source.unwrap_or_default(),
            queues: file.queues.unwrap_or_default(),
            tracker: file.tracker.unwrap_or_default(),
            gallery: file.gallery.unwrap_or_default(),
            correlation: file.correlation.unwrap_or_default(),
            drain_timeout_ms: file.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FACEPIPE_GALLERY_PATH") {
            if !path.trim().is_empty() {
                self.gallery.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(thr) = std::env::var("FACEPIPE_SIMILARITY_THR") {
            self.gallery.similarity_thr = thr
                .parse()
                .map_err(|_| anyhow!("FACEPIPE_SIMILARITY_THR must be a number in [0,1]"))?;
        }
        if let Ok(fps) = std::env::var("FACEPIPE_TARGET_FPS") {
            self.source.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("FACEPIPE_TARGET_FPS must be an integer"))?;
        }
        if let Ok(limit) = std::env::var("FACEPIPE_FRAME_LIMIT") {
            self.source.frame_limit = limit
                .parse()
                .map_err(|_| anyhow!("FACEPIPE_FRAME_LIMIT must be an integer"))?;
        }
        if let Ok(capacity) = std::env::var("FACEPIPE_QUEUE_CAPACITY") {
            self.queues.default_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("FACEPIPE_QUEUE_CAPACITY must be an integer"))?;
        }
        if let Ok(ms) = std::env::var("FACEPIPE_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = ms
                .parse()
                .map_err(|_| anyhow!("FACEPIPE_DRAIN_TIMEOUT_MS must be an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be non-zero"));
        }
        if self.queues.default_capacity == 0 {
            return Err(anyhow!("queues.default_capacity must be >= 1"));
        }
        for (link, over) in &self.queues.overrides {
            if over.capacity == Some(0) {
                return Err(anyhow!("queue override for '{}' must have capacity >= 1", link));
            }
        }
        if self.correlation.timeout_ms == 0 {
            return Err(anyhow!("correlation.timeout_ms must be >= 1"));
        }
        if self.correlation.max_pending_frames == 0 {
            return Err(anyhow!("correlation.max_pending_frames must be >= 1"));
        }
        self.tracker.validate()?;
        self.gallery.validate()?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FacepipeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = FacepipeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queues.default_capacity, 30);
        assert_eq!(cfg.gallery.queue_size, 20);
        assert!((cfg.tracker.iou_thr - 0.8).abs() < 1e-6);
    }

    #[test]
    fn queue_override_applies_to_named_link_only() {
        let mut cfg = FacepipeConfig::default();
        cfg.queues.overrides.insert(
            "pre_detect_q".into(),
            LinkOverride {
                capacity: Some(5),
                policy: Some(OverflowPolicy::DropOldest),
            },
        );
        let spec = cfg.queues.spec_for("pre_detect_q");
        assert_eq!(spec.capacity, 5);
        assert_eq!(spec.policy, OverflowPolicy::DropOldest);

        let other = cfg.queues.spec_for("pre_tracker_q");
        assert_eq!(other.capacity, 30);
        assert_eq!(other.policy, OverflowPolicy::Block);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = FacepipeConfig::default();
        cfg.queues.default_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn file_sections_parse() {
        let raw = r#"{
            "source": { "width": 320, "height": 240, "target_fps": 5, "frame_limit": 100 },
            "queues": {
                "default_capacity": 16,
                "overrides": { "pre_detect_q": { "policy": "drop-oldest" } }
            },
            "tracker": { "iou_thr": 0.7 },
            "gallery": { "similarity_thr": 0.5, "queue_size": 10 },
            "correlation": { "timeout_ms": 250 },
            "drain_timeout_ms": 1000
        }"#;
        let file: FacepipeConfigFile = serde_json::from_str(raw).unwrap();
        let cfg = FacepipeConfig::from_file(file);
        cfg.validate().unwrap();

        assert_eq!(cfg.source.width, 320);
        assert_eq!(cfg.queues.default_capacity, 16);
        assert_eq!(
            cfg.queues.spec_for("pre_detect_q").policy,
            OverflowPolicy::DropOldest
        );
        assert!((cfg.tracker.iou_thr - 0.7).abs() < 1e-6);
        assert_eq!(cfg.gallery.queue_size, 10);
        assert_eq!(cfg.correlation.timeout_ms, 250);
        assert_eq!(cfg.drain_timeout_ms, 1000);
    }
}
