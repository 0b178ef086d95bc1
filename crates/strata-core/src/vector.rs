//! Vector similarity over opaque entity embeddings

use crate::entity::Entity;
use serde::{Deserialize, Serialize};

/// Score reported by stores without a native vector index.
///
/// Midpoint of the `[0, 1]` similarity range, so callers can tell that the
/// ranking carries no similarity signal.
pub const FALLBACK_SIMILARITY: f32 = 0.5;

/// An entity returned by `vector_search` with its similarity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub entity: Entity,
    pub score: f32,
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Rank entities by cosine similarity to `query`, best first.
///
/// Entities without an embedding, or with one of a different dimension,
/// are skipped.
pub fn rank_by_similarity(
    query: &[f32],
    entities: impl IntoIterator<Item = Entity>,
    max_results: usize,
) -> Vec<VectorMatch> {
    let mut matches: Vec<VectorMatch> = entities
        .into_iter()
        .filter_map(|entity| {
            let score = match &entity.embedding {
                Some(embedding) if embedding.len() == query.len() => {
                    cosine_similarity(query, embedding)
                }
                _ => return None,
            };
            Some(VectorMatch { entity, score })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
    matches.truncate(max_results);
    matches
}

/// Neutral ranking used when no similarity can be computed
pub fn fallback_matches(
    entities: impl IntoIterator<Item = Entity>,
    max_results: usize,
) -> Vec<VectorMatch> {
    entities
        .into_iter()
        .filter(|e| e.embedding.is_some())
        .take(max_results)
        .map(|entity| VectorMatch {
            entity,
            score: FALLBACK_SIMILARITY,
        })
        .collect()
}
