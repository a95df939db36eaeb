//! Keyword, vector, and hybrid retrieval over the store.
//!
//! The keyword side queries the FTS5 table and maps BM25 ranks into
//! `[0, 1]`; the vector side scans packed embedding BLOBs and maps cosine
//! similarity from `[-1, 1]` into `[0, 1]`. Hybrid fusion takes the
//! weighted union of both lists keyed by chunk id, treating a missing
//! side as zero.
//!
//! Both scans filter rows to the configured sources and the active model
//! string, so an index mid-model-upgrade only surfaces current rows.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Source;
use crate::store::blob_to_vec;

/// One ranked chunk.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    /// Relevance in `[0, 1]` (per-engine normalized, or fused).
    pub score: f64,
}

/// Map an FTS5 BM25 rank (more negative = better) into `[0, 1)`.
pub fn bm25_rank_to_score(rank: f64) -> f64 {
    let positive = (-rank).max(0.0);
    positive / (positive + 1.0)
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Build an FTS5 MATCH expression from free text: each token quoted,
/// OR-joined. Returns `None` when no tokens survive.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn source_placeholders(sources: &[Source]) -> String {
    vec!["?"; sources.len().max(1)].join(", ")
}

/// BM25 keyword scan over `chunks_fts`, capped at `limit`.
pub async fn keyword_search(
    pool: &SqlitePool,
    query: &str,
    limit: usize,
    sources: &[Source],
    model: &str,
) -> Result<Vec<SearchResult>> {
    let match_expr = match fts_match_expr(query) {
        Some(expr) => expr,
        None => return Ok(Vec::new()),
    };

    let sql = format!(
        "SELECT chunks.id AS id, chunks.path AS path, chunks.source AS source, \
                chunks.start_line AS start_line, chunks.end_line AS end_line, \
                chunks.text AS text, chunks_fts.rank AS rank \
         FROM chunks_fts \
         JOIN chunks ON chunks.id = chunks_fts.id \
         WHERE chunks_fts MATCH ? AND chunks_fts.model = ? AND chunks.source IN ({}) \
         ORDER BY chunks_fts.rank LIMIT ?",
        source_placeholders(sources)
    );

    let mut query_builder = sqlx::query(&sql).bind(&match_expr).bind(model);
    for source in sources {
        query_builder = query_builder.bind(source.as_str());
    }
    let rows = query_builder
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            SearchResult {
                id: row.get("id"),
                path: row.get("path"),
                source: row.get("source"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                snippet: row.get("text"),
                score: bm25_rank_to_score(rank),
            }
        })
        .collect())
}

/// Cosine scan over `chunks_vec`, capped at `limit`. Scores are cosine
/// similarity mapped into `[0, 1]`.
pub async fn vector_search(
    pool: &SqlitePool,
    query_vector: &[f32],
    limit: usize,
    sources: &[Source],
    model: &str,
) -> Result<Vec<SearchResult>> {
    if query_vector.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT v.id AS id, v.embedding AS embedding, \
                c.path AS path, c.source AS source, \
                c.start_line AS start_line, c.end_line AS end_line, c.text AS text \
         FROM chunks_vec v \
         JOIN chunks c ON c.id = v.id \
         WHERE c.model = ? AND c.source IN ({})",
        source_placeholders(sources)
    );

    let mut query_builder = sqlx::query(&sql).bind(model);
    for source in sources {
        query_builder = query_builder.bind(source.as_str());
    }
    let rows = query_builder.fetch_all(pool).await?;

    let mut results: Vec<SearchResult> = rows
        .into_iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let cosine = cosine_similarity(query_vector, &blob_to_vec(&blob));
            SearchResult {
                id: row.get("id"),
                path: row.get("path"),
                source: row.get("source"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                snippet: row.get("text"),
                score: f64::from(cosine + 1.0) / 2.0,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    Ok(results)
}

/// Weighted union of vector and keyword hits keyed by chunk id. A side
/// that did not return a chunk contributes zero to its combined score.
pub fn fuse_hybrid(
    vector_hits: Vec<SearchResult>,
    keyword_hits: Vec<SearchResult>,
    vector_weight: f64,
    text_weight: f64,
) -> Vec<SearchResult> {
    use std::collections::HashMap;

    struct Fused {
        result: SearchResult,
        vector_score: f64,
        text_score: f64,
    }

    let mut by_id: HashMap<String, Fused> = HashMap::new();

    for hit in vector_hits {
        let score = hit.score;
        by_id
            .entry(hit.id.clone())
            .and_modify(|f| f.vector_score = f.vector_score.max(score))
            .or_insert(Fused {
                result: hit,
                vector_score: score,
                text_score: 0.0,
            });
    }
    for hit in keyword_hits {
        let score = hit.score;
        by_id
            .entry(hit.id.clone())
            .and_modify(|f| f.text_score = f.text_score.max(score))
            .or_insert(Fused {
                result: hit,
                vector_score: 0.0,
                text_score: score,
            });
    }

    let mut fused: Vec<SearchResult> = by_id
        .into_values()
        .map(|f| {
            let mut result = f.result;
            result.score = vector_weight * f.vector_score + text_weight * f.text_score;
            result
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            path: format!("memory/{id}.md"),
            source: "memory".to_string(),
            start_line: 1,
            end_line: 1,
            snippet: id.to_string(),
            score,
        }
    }

    #[test]
    fn bm25_mapping_is_monotone_and_bounded() {
        // More negative rank = better match = higher score.
        let better = bm25_rank_to_score(-8.0);
        let worse = bm25_rank_to_score(-0.5);
        assert!(better > worse);
        assert!((0.0..1.0).contains(&better));
        assert_eq!(bm25_rank_to_score(0.0), 0.0);
        assert_eq!(bm25_rank_to_score(3.0), 0.0);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn fusion_weights_and_orders() {
        // Vector: A=0.9, B=0.5. Keyword: B=0.7, C=0.4.
        // Weights 0.6/0.4 give A=0.54, B=0.58, C=0.16.
        let fused = fuse_hybrid(
            vec![hit("A", 0.9), hit("B", 0.5)],
            vec![hit("B", 0.7), hit("C", 0.4)],
            0.6,
            0.4,
        );
        let order: Vec<&str> = fused.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
        assert!((fused[0].score - 0.58).abs() < 1e-9);
        assert!((fused[1].score - 0.54).abs() < 1e-9);
        assert!((fused[2].score - 0.16).abs() < 1e-9);

        let above_half: Vec<&str> = fused
            .iter()
            .filter(|r| r.score >= 0.5)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(above_half, vec!["B", "A"]);
    }

    #[test]
    fn fusion_of_empty_sides() {
        assert!(fuse_hybrid(vec![], vec![], 0.7, 0.3).is_empty());
        let only_vector = fuse_hybrid(vec![hit("A", 0.8)], vec![], 0.5, 0.5);
        assert_eq!(only_vector.len(), 1);
        assert!((only_vector[0].score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn match_expr_quotes_tokens() {
        assert_eq!(
            fts_match_expr("rust async-runtime").unwrap(),
            "\"rust\" OR \"async\" OR \"runtime\""
        );
        assert!(fts_match_expr("  --- ").is_none());
    }
}
