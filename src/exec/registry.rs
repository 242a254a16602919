use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{FaceDetector, FaceEmbedder};

/// Thread-safe registry of model-backed executors.
///
/// Backends are wrapped in `Mutex` because their calls take `&mut self`.
/// The lightweight pixel ops (crop, align, overlay) are constructed directly
/// and do not go through the registry.
pub struct ExecutorRegistry {
    detectors: HashMap<String, Arc<Mutex<dyn FaceDetector>>>,
    embedders: HashMap<String, Arc<Mutex<dyn FaceEmbedder>>>,
    default_detector: Option<String>,
    default_embedder: Option<String>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            embedders: HashMap::new(),
            default_detector: None,
            default_embedder: None,
        }
    }

    /// Register a detector. The first registered detector becomes the default.
    pub fn register_detector<D: FaceDetector + 'static>(&mut self, detector: D) {
        let name = detector.name().to_string();
        if self.default_detector.is_none() {
            self.default_detector = Some(name.clone());
        }
        self.detectors.insert(name, Arc::new(Mutex::new(detector)));
    }

    /// Register an embedder. The first registered embedder becomes the default.
    pub fn register_embedder<E: FaceEmbedder + 'static>(&mut self, embedder: E) {
        let name = embedder.name().to_string();
        if self.default_embedder.is_none() {
            self.default_embedder = Some(name.clone());
        }
        self.embedders.insert(name, Arc::new(Mutex::new(embedder)));
    }

    pub fn set_default_detector(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_detector = Some(name.to_string());
        Ok(())
    }

    pub fn set_default_embedder(&mut self, name: &str) -> Result<()> {
        if !self.embedders.contains_key(name) {
            return Err(anyhow!("embedder '{}' not registered", name));
        }
        self.default_embedder = Some(name.to_string());
        Ok(())
    }

    pub fn detector(&self, name: &str) -> Option<Arc<Mutex<dyn FaceDetector>>> {
        self.detectors.get(name).cloned()
    }

    pub fn embedder(&self, name: &str) -> Option<Arc<Mutex<dyn FaceEmbedder>>> {
        self.embedders.get(name).cloned()
    }

    pub fn default_detector(&self) -> Result<Arc<Mutex<dyn FaceDetector>>> {
        self.default_detector
            .as_ref()
            .and_then(|name| self.detector(name))
            .ok_or_else(|| anyhow!("no detector registered"))
    }

    pub fn default_embedder(&self) -> Result<Arc<Mutex<dyn FaceEmbedder>>> {
        self.default_embedder
            .as_ref()
            .and_then(|name| self.embedder(name))
            .ok_or_else(|| anyhow!("no embedder registered"))
    }

    pub fn list_detectors(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    pub fn list_embedders(&self) -> Vec<String> {
        self.embedders.keys().cloned().collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{StubEmbedder, StubFaceDetector};

    #[test]
    fn first_registered_becomes_default() {
        let mut registry = ExecutorRegistry::new();
        registry.register_detector(StubFaceDetector::new(200));
        registry.register_embedder(StubEmbedder::new());

        assert!(registry.default_detector().is_ok());
        assert!(registry.default_embedder().is_ok());
        assert_eq!(registry.list_detectors(), vec!["stub".to_string()]);
    }

    #[test]
    fn default_selection_rejects_unknown_name() {
        let mut registry = ExecutorRegistry::new();
        registry.register_detector(StubFaceDetector::new(200));
        assert!(registry.set_default_detector("onnx").is_err());
        assert!(registry.set_default_detector("stub").is_ok());
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = ExecutorRegistry::new();
        assert!(registry.default_detector().is_err());
        assert!(registry.default_embedder().is_err());
    }
}
