use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::GalleryEntry;

/// Gallery persistence capability. The pipeline core never sees the storage
/// format, only these two calls. `load` failure is startup-fatal.
pub trait GalleryStore: Send {
    fn load(&self) -> Result<Vec<GalleryEntry>>;
    fn insert(&self, entry: GalleryEntry) -> Result<()>;
}

/// JSON-file backed store: one array of entries.
pub struct JsonGalleryStore {
    path: PathBuf,
}

impl JsonGalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl GalleryStore for JsonGalleryStore {
    fn load(&self) -> Result<Vec<GalleryEntry>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading gallery file {}", self.path.display()))?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing gallery file {}", self.path.display()))?;
        Ok(entries)
    }

    fn insert(&self, entry: GalleryEntry) -> Result<()> {
        let mut entries = if self.path.exists() {
            self.load()?
        } else {
            Vec::new()
        };
        entries.push(entry);
        let raw = serde_json::to_string_pretty(&entries).context("serializing gallery")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing gallery file {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and gallery-less runs.
#[derive(Default)]
pub struct InMemoryGalleryStore {
    entries: Mutex<Vec<GalleryEntry>>,
}

impl InMemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl GalleryStore for InMemoryGalleryStore {
    fn load(&self) -> Result<Vec<GalleryEntry>> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }

    fn insert(&self, entry: GalleryEntry) -> Result<()> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(entry);
        Ok(())
    }
}
