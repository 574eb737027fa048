//! Pure aggregation and ranking of chunk matches into article recommendations.
//!
//! Nothing in this module performs I/O. It is a deterministic function of
//! its inputs: the same `ChunkMatch` slice in any order yields the same
//! sorted `ArticleRecommendation` list.

use std::collections::HashMap;

use uuid::Uuid;

use crate::models::{ArticleRecommendation, ChunkMatch, ChunkMatchSummary, RankingMode};

/// Group matches by article, score each group, and sort deterministically.
///
/// Recommendations come back with empty `title`/`category`/`url` —
/// enrichment is an I/O step performed afterward by the caller.
pub fn aggregate(matches: &[ChunkMatch], mode: RankingMode) -> Vec<ArticleRecommendation> {
    let mut groups: HashMap<Uuid, Vec<&ChunkMatch>> = HashMap::new();
    for m in matches {
        groups.entry(m.article_id).or_default().push(m);
    }

    let mut recommendations: Vec<ArticleRecommendation> = groups
        .into_iter()
        .map(|(article_id, group)| build_recommendation(article_id, &group, mode))
        .collect();

    recommendations.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.article_id.cmp(&b.article_id))
    });

    recommendations
}

fn build_recommendation(
    article_id: Uuid,
    group: &[&ChunkMatch],
    mode: RankingMode,
) -> ArticleRecommendation {
    let chunk_count = group.len();
    let max_sim = group
        .iter()
        .map(|m| m.similarity_score)
        .fold(f64::MIN, f64::max);
    let sum_sim: f64 = group.iter().map(|m| m.similarity_score).sum();
    let avg_sim = sum_sim / chunk_count as f64;

    let hybrid_score = match mode {
        RankingMode::Query => 0.7 * max_sim + 0.3 * avg_sim,
        RankingMode::Article => {
            let coverage_bonus = (chunk_count as f64 / 3.0).min(0.2);
            0.6 * max_sim + 0.4 * avg_sim + coverage_bonus
        }
    };

    let mut chunk_matches: Vec<ChunkMatchSummary> = group
        .iter()
        .map(|m| ChunkMatchSummary {
            chunk_id: m.chunk_id,
            score: m.similarity_score,
            chunk_index: m.chunk_index,
            content_preview: m.content_preview.clone(),
        })
        .collect();
    chunk_matches.sort_by_key(|c| c.chunk_index);

    ArticleRecommendation {
        article_id,
        title: None,
        category: None,
        url: None,
        hybrid_score,
        max_similarity: max_sim,
        avg_similarity: avg_sim,
        chunk_matches,
        matched_chunks: chunk_count as i64,
    }
}
