//! Identity gallery and the matcher stage that consults it.

mod store;

pub use store::{GalleryStore, InMemoryGalleryStore, JsonGalleryStore};

use serde::{Deserialize, Serialize};

use crate::branch::{EmbeddedFace, MatchedFace};
use crate::frame::{Embedding, IdentityMatch};
use crate::monitor::{Monitor, PipelineEvent};
use crate::stage::{Stage, StageError};

/// One enrolled identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
    /// Microseconds since the epoch; updated on a successful match.
    pub last_seen: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GalleryConfig {
    /// Minimum cosine similarity for a match.
    pub similarity_thr: f32,
    /// Maximum enrolled entries; insertion past this evicts oldest-first.
    pub queue_size: usize,
    /// Backing JSON file. None runs with an in-memory gallery.
    pub path: Option<std::path::PathBuf>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            similarity_thr: 0.4,
            queue_size: 20,
            path: None,
        }
    }
}

impl GalleryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_thr) {
            anyhow::bail!(
                "gallery.similarity_thr must be in [0,1], got {}",
                self.similarity_thr
            );
        }
        if self.queue_size == 0 {
            anyhow::bail!("gallery.queue_size must be >= 1");
        }
        Ok(())
    }
}

struct Enrolled {
    entry: GalleryEntry,
    /// Monotonic insertion index; the lookup tie-break and the oldest-first
    /// eviction order both key off it.
    inserted: u64,
}

/// The result of a lookup that found a best candidate.
pub struct LookupHit<'a> {
    pub entry: &'a GalleryEntry,
    pub similarity: f32,
}

/// Bounded in-memory identity set. Lookup is deterministic: for a given
/// embedding and gallery state, the same entry wins every time (highest
/// similarity, then lowest insertion index).
pub struct Gallery {
    entries: Vec<Enrolled>,
    capacity: usize,
    next_insertion: u64,
}

impl Gallery {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
            next_insertion: 0,
        }
    }

    /// Build a gallery from persisted entries, in their stored order.
    pub fn from_entries(capacity: usize, entries: Vec<GalleryEntry>) -> Self {
        let mut gallery = Self::new(capacity);
        for entry in entries {
            gallery.insert(entry);
        }
        gallery
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: GalleryEntry) {
        while self.entries.len() >= self.capacity {
            // Oldest-first eviction.
            if let Some(pos) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(pos, _)| pos)
            {
                self.entries.remove(pos);
            }
        }
        self.entries.push(Enrolled {
            entry,
            inserted: self.next_insertion,
        });
        self.next_insertion += 1;
    }

    /// Nearest entry by cosine similarity, regardless of threshold.
    pub fn lookup(&self, embedding: &Embedding) -> Option<LookupHit<'_>> {
        let mut best: Option<(f32, &Enrolled)> = None;
        for enrolled in &self.entries {
            let sim = embedding.cosine_similarity(&enrolled.entry.embedding);
            let better = match best {
                None => true,
                Some((best_sim, best_enrolled)) => {
                    sim > best_sim
                        || (sim == best_sim && enrolled.inserted < best_enrolled.inserted)
                }
            };
            if better {
                best = Some((sim, enrolled));
            }
        }
        best.map(|(similarity, enrolled)| LookupHit {
            entry: &enrolled.entry,
            similarity,
        })
    }

    /// Refresh an entry's last-seen timestamp after a successful match.
    pub fn touch(&mut self, label: &str, ts_micros: u64) {
        for enrolled in &mut self.entries {
            if enrolled.entry.label == label {
                enrolled.entry.last_seen = ts_micros;
            }
        }
    }
}

/// Sub-path stage attaching gallery identities to embedded faces.
pub struct MatcherStage {
    gallery: Gallery,
    similarity_thr: f32,
    monitor: Monitor,
}

impl MatcherStage {
    pub fn new(gallery: Gallery, similarity_thr: f32, monitor: Monitor) -> Self {
        Self {
            gallery,
            similarity_thr,
            monitor,
        }
    }
}

impl Stage<EmbeddedFace, MatchedFace> for MatcherStage {
    fn name(&self) -> &str {
        "matcher"
    }

    fn process(&mut self, face: EmbeddedFace) -> Result<Vec<MatchedFace>, StageError> {
        let identity = match self.gallery.lookup(&face.embedding) {
            Some(hit) if hit.similarity >= self.similarity_thr => Some(IdentityMatch {
                label: hit.entry.label.clone(),
                similarity: hit.similarity,
            }),
            _ => None,
        };

        if let Some(identity) = &identity {
            self.gallery
                .touch(&identity.label, crate::frame::Frame::now_micros());
            self.monitor.report(PipelineEvent::IdentityMatched {
                frame_id: face.key.frame_id,
                det_index: face.key.det_index,
                label: identity.label.clone(),
                similarity: identity.similarity,
            });
        }

        Ok(vec![MatchedFace {
            key: face.key,
            track_id: face.track_id,
            embedding: face.embedding,
            identity,
        }])
    }
}
