use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use super::metric::SimilarityMetric;
use super::store::{Embedding, ReidStore, SimilarityMatch, merge_matches};
use crate::error::{FusionError, Result};

struct Entry {
    identity: Uuid,
    source_track: String,
    class: String,
    vector: Embedding,
}

struct VectorSet {
    metric: SimilarityMetric,
    dimensions: usize,
    entries: Vec<Entry>,
}

impl VectorSet {
    fn check_dimensions(&self, set: &str, vectors: &[Embedding]) -> Result<()> {
        match vectors.iter().find(|v| v.len() != self.dimensions) {
            Some(v) => Err(FusionError::Store(format!(
                "set '{set}' holds {}-dimensional vectors, got {}",
                self.dimensions,
                v.len()
            ))),
            None => Ok(()),
        }
    }
}

/// In-process brute-force nearest-neighbour index.
#[derive(Default)]
pub struct MemoryStore {
    connected: AtomicBool,
    sets: RwLock<HashMap<String, VectorSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored vectors in a set.
    pub fn len(&self, set: &str) -> usize {
        self.sets.read().get(set).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, set: &str) -> bool {
        self.len(set) == 0
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FusionError::NotConnected)
        }
    }
}

impl ReidStore for MemoryStore {
    fn connect(&self, _endpoint: &str) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn define_schema(&self, set: &str, metric: SimilarityMetric, dimensions: usize) -> Result<()> {
        self.ensure_connected()?;
        let mut sets = self.sets.write();
        if let Some(existing) = sets.get(set) {
            if existing.metric == metric && existing.dimensions == dimensions {
                return Ok(());
            }
            return Err(FusionError::SchemaConflict {
                set: set.to_string(),
                reason: format!(
                    "defined as {:?}/{}, requested {:?}/{}",
                    existing.metric, existing.dimensions, metric, dimensions
                ),
            });
        }
        sets.insert(
            set.to_string(),
            VectorSet {
                metric,
                dimensions,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    fn find_schema(&self, set: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.sets.read().contains_key(set))
    }

    fn add_entry(
        &self,
        identity: Uuid,
        source_track: &str,
        class: &str,
        vectors: &[Embedding],
        set: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        let mut sets = self.sets.write();
        let target = sets
            .get_mut(set)
            .ok_or_else(|| FusionError::SchemaNotFound(set.to_string()))?;
        target.check_dimensions(set, vectors)?;
        target.entries.extend(vectors.iter().map(|v| Entry {
            identity,
            source_track: source_track.to_string(),
            class: class.to_string(),
            vector: v.clone(),
        }));
        Ok(())
    }

    fn find_similar(
        &self,
        class: &str,
        vectors: &[Embedding],
        set: &str,
        k: usize,
    ) -> Result<Vec<SimilarityMatch>> {
        self.ensure_connected()?;
        let sets = self.sets.read();
        let target = sets
            .get(set)
            .ok_or_else(|| FusionError::SchemaNotFound(set.to_string()))?;
        target.check_dimensions(set, vectors)?;
        let metric = target.metric;
        let candidates = vectors.iter().flat_map(|query| {
            target
                .entries
                .iter()
                .filter(|e| e.class == class)
                .map(move |e| {
                    let distance = metric.distance(query, &e.vector);
                    SimilarityMatch {
                        identity: e.identity,
                        source_track: e.source_track.clone(),
                        class: e.class.clone(),
                        distance,
                        similarity: metric.similarity(distance),
                    }
                })
        });
        Ok(merge_matches(candidates, k))
    }
}
