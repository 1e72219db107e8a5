use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use uuid::Uuid;

use super::metric::SimilarityMetric;
use crate::error::{FusionError, Result};

/// Appearance embedding produced by a re-identification model.
pub type Embedding = Vec<f32>;

/// One ranked answer from [`ReidStore::find_similar`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    /// Fused identity the entry was stored under.
    pub identity: Uuid,
    /// Track id the entry came from (the sensor-side id of the first sighting).
    pub source_track: String,
    pub class: String,
    pub distance: f64,
    pub similarity: f64,
}

/// Capabilities shared by every re-identification backend.
///
/// Implementations use interior mutability so a store can sit behind an `Arc` and be
/// queried from a worker thread.
pub trait ReidStore: Send + Sync {
    /// Open the backend. Every other call fails with `NotConnected` until this succeeds.
    fn connect(&self, endpoint: &str) -> Result<()>;

    /// Declare a vector set. Idempotent for identical parameters, `SchemaConflict` otherwise.
    fn define_schema(&self, set: &str, metric: SimilarityMetric, dimensions: usize) -> Result<()>;

    fn find_schema(&self, set: &str) -> Result<bool>;

    /// Append embeddings for an identity. Earlier entries are never replaced.
    fn add_entry(
        &self,
        identity: Uuid,
        source_track: &str,
        class: &str,
        vectors: &[Embedding],
        set: &str,
    ) -> Result<()>;

    /// Up to `k` identities of `class` closest to any of `vectors`, best first. An empty set
    /// yields an empty result.
    fn find_similar(
        &self,
        class: &str,
        vectors: &[Embedding],
        set: &str,
        k: usize,
    ) -> Result<Vec<SimilarityMatch>>;
}

/// Collapse matches to one per identity (keeping the most similar) and keep the top `k`.
pub fn merge_matches(
    matches: impl IntoIterator<Item = SimilarityMatch>,
    k: usize,
) -> Vec<SimilarityMatch> {
    let mut best: HashMap<Uuid, SimilarityMatch> = HashMap::new();
    for m in matches {
        match best.get(&m.identity) {
            Some(current) if current.similarity >= m.similarity => {}
            _ => {
                best.insert(m.identity, m);
            }
        }
    }
    let mut merged: Vec<SimilarityMatch> = best.into_values().collect();
    merged.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    merged.truncate(k);
    merged
}

/// Pack an embedding as base64 of its little-endian `f32` bytes.
pub fn encode_embedding(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// Inverse of [`encode_embedding`].
pub fn decode_embedding(encoded: &str) -> Result<Embedding> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| FusionError::validation("reid", format!("invalid base64: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(FusionError::validation(
            "reid",
            format!("{} bytes is not a whole number of f32 values", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(identity: Uuid, similarity: f64) -> SimilarityMatch {
        SimilarityMatch {
            identity,
            source_track: "1".into(),
            class: "person".into(),
            distance: 1.0 - similarity,
            similarity,
        }
    }

    #[test]
    fn test_merge_keeps_best_per_identity() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_matches(vec![m(a, 0.4), m(b, 0.6), m(a, 0.9)], 5);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].identity, a);
        assert_eq!(merged[0].similarity, 0.9);
        assert_eq!(merge_matches(vec![m(a, 0.4), m(b, 0.6)], 1)[0].identity, b);
    }

    #[test]
    fn test_embedding_codec() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding("AAA=").is_err());
        assert!(decode_embedding("not base64!").is_err());
    }
}
