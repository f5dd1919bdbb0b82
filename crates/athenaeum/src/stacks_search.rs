use std::sync::Arc;

use serde_json::json;

use crate::cosine::cosine_similarity_with_norms;
use crate::inverted_index::Bm25Params;
use crate::metadata_index::{matches_all_metadata_filters, matches_filter, FilterOp, MetadataFilter};
use crate::schema::Volume;
use crate::stacks::Stacks;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub volume: Volume,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub similarity_threshold: f32,
    pub max_results: usize,
    pub metadata_filters: Vec<MetadataFilter>,
    pub topic: Option<String>,
    pub shelf: Option<String>,
    pub date_range: Option<(i64, i64)>,
    pub hybrid_alpha: f32,
}

impl SearchOptions {
    pub fn with_defaults(max_results: usize, similarity_threshold: f32, hybrid_alpha: f32) -> Self {
        Self {
            similarity_threshold,
            max_results,
            hybrid_alpha,
            ..Default::default()
        }
    }
}

/// Vector search, text search, hybrid, and metadata/date filters over a
/// `Stacks` instance.
pub struct StacksSearch {
    stacks: Arc<Stacks>,
}

impl StacksSearch {
    pub fn new(stacks: Arc<Stacks>) -> Self {
        Self { stacks }
    }

    async fn candidates(&self, options: &SearchOptions) -> Vec<Volume> {
        let mut candidates = if let Some(topic) = &options.topic {
            let ids = self.stacks.topic_entries(topic).await;
            let mut volumes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(v) = self.stacks.get(&id).await {
                    volumes.push(v);
                }
            }
            volumes
        } else {
            self.stacks.all().await
        };

        if let Some(shelf) = &options.shelf {
            candidates.retain(|v| v.shelf() == Some(shelf.as_str()));
        }

        if !options.metadata_filters.is_empty() {
            candidates.retain(|v| matches_all_metadata_filters(&v.metadata, &options.metadata_filters));
        }

        if let Some((from, to)) = options.date_range {
            candidates.retain(|v| v.timestamp >= from && v.timestamp <= to);
        }

        candidates
    }

    /// Applies filters first, scores candidates by cosine against the
    /// query embedding using the `MagnitudeCache`, keeps results at or
    /// above `similarity_threshold`, sorts descending, truncates. Bumps
    /// access stats for returned volumes as a side effect.
    pub async fn vector_search(
        &self,
        query_embedding: &[f32],
        options: &SearchOptions,
        now_ms: i64,
    ) -> Vec<SearchResult> {
        if query_embedding.is_empty() {
            return Vec::new();
        }

        let candidates = self.candidates(options).await;
        let query_norm = crate::cosine::magnitude(query_embedding);

        let mut scored = Vec::new();
        for volume in candidates {
            let norm = self.stacks.magnitude(&volume.id).await;
            let score = cosine_similarity_with_norms(query_embedding, &volume.embedding, Some(query_norm), norm);
            if score >= options.similarity_threshold {
                scored.push(SearchResult {
                    id: volume.id.clone(),
                    score,
                    volume,
                });
            }
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let max_results = if options.max_results == 0 { scored.len() } else { options.max_results };
        scored.truncate(max_results);

        for result in &scored {
            self.stacks.bump_access(&result.id, now_ms).await;
        }

        scored
    }

    /// Delegates to `InvertedIndex::bm25_search`, then applies the same
    /// metadata/topic/shelf/date filters.
    pub async fn text_search(&self, query: &str, options: &SearchOptions) -> Vec<SearchResult> {
        let bm25 = self.stacks.bm25_search(query, Bm25Params::default()).await;
        let candidates = self.candidates(options).await;
        let allowed: std::collections::HashSet<String> = candidates.iter().map(|v| v.id.clone()).collect();

        let mut results = Vec::new();
        for (id, score) in bm25 {
            if !allowed.contains(&id) {
                continue;
            }
            if let Some(volume) = self.stacks.get(&id).await {
                results.push(SearchResult { id, score, volume });
            }
        }

        let max_results = if options.max_results == 0 { results.len() } else { options.max_results };
        results.truncate(max_results);
        results
    }

    /// Runs both searches, normalizes each score to `[0,1]` by dividing by
    /// the max within its own result set, blends with `alpha`, and breaks
    /// ties by timestamp descending.
    pub async fn advanced_search(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &SearchOptions,
        now_ms: i64,
    ) -> Vec<SearchResult> {
        let vector_results = match query_embedding {
            Some(embedding) if !embedding.is_empty() => {
                self.vector_search(
                    embedding,
                    &SearchOptions {
                        max_results: 0,
                        similarity_threshold: 0.0,
                        ..options.clone()
                    },
                    now_ms,
                )
                .await
            }
            _ => Vec::new(),
        };
        let text_results = self
            .text_search(
                query,
                &SearchOptions {
                    max_results: 0,
                    ..options.clone()
                },
            )
            .await;

        let vector_max = vector_results.iter().map(|r| r.score).fold(0.0_f32, f32::max);
        let text_max = text_results.iter().map(|r| r.score).fold(0.0_f32, f32::max);

        let mut blended: std::collections::HashMap<String, (f32, f32, Volume)> = std::collections::HashMap::new();
        for r in vector_results {
            let normalized = if vector_max > 0.0 { r.score / vector_max } else { 0.0 };
            blended.insert(r.id.clone(), (normalized, 0.0, r.volume));
        }
        for r in text_results {
            let normalized = if text_max > 0.0 { r.score / text_max } else { 0.0 };
            blended
                .entry(r.id.clone())
                .and_modify(|(_, bm25, _)| *bm25 = normalized)
                .or_insert((0.0, normalized, r.volume));
        }

        let alpha = if options.hybrid_alpha > 0.0 { options.hybrid_alpha } else { 0.6 };
        let mut results: Vec<SearchResult> = blended
            .into_iter()
            .map(|(id, (vector, bm25, volume))| SearchResult {
                id,
                score: alpha * vector + (1.0 - alpha) * bm25,
                volume,
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.volume.timestamp.cmp(&a.volume.timestamp))
        });

        let max_results = if options.max_results == 0 { results.len() } else { options.max_results };
        results.truncate(max_results);
        results
    }
}

/// A minimal query of the form
/// `free text  +tag:x  -topic:y/z  after:2025-01-01  score>0.5`.
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub text: String,
    pub metadata_filters: Vec<MetadataFilter>,
    pub topic_filters: Vec<MetadataFilter>,
    pub date_range: Option<(i64, i64)>,
}

fn parse_date_to_epoch_ms(date: &str) -> Option<i64> {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

pub fn parse_query(raw: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let mut text_tokens = Vec::new();

    for token in raw.split_whitespace() {
        if let Some(rest) = token.strip_prefix("+tag:") {
            parsed.metadata_filters.push(MetadataFilter {
                key: "tags".into(),
                op: FilterOp::Contains,
                value: json!(rest),
            });
        } else if let Some(rest) = token.strip_prefix("-topic:") {
            parsed.topic_filters.push(MetadataFilter {
                key: "topic".into(),
                op: FilterOp::Neq,
                value: json!(rest),
            });
        } else if let Some(rest) = token.strip_prefix("after:") {
            if let Some(epoch) = parse_date_to_epoch_ms(rest) {
                parsed.date_range = Some((epoch, i64::MAX));
            }
        } else if let Some(rest) = token.strip_prefix("score>") {
            if let Ok(value) = rest.parse::<f64>() {
                parsed.metadata_filters.push(MetadataFilter {
                    key: "score".into(),
                    op: FilterOp::Gt,
                    value: json!(value),
                });
            }
        } else {
            text_tokens.push(token);
        }
    }

    parsed.text = text_tokens.join(" ");
    parsed
}

/// Evaluate a `ParsedQuery`'s topic filters against a single volume's
/// metadata, independent of the main AND-across-filters metadata path.
pub fn matches_topic_filters(metadata: &std::collections::HashMap<String, String>, parsed: &ParsedQuery) -> bool {
    parsed.topic_filters.iter().all(|f| matches_filter(metadata, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorageBackend;
    use std::collections::HashMap;

    async fn stacks_with(entries: &[(&str, &[f32], &str)]) -> (tempfile::TempDir, Arc<Stacks>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::open(dir.path().join("s.redb")).unwrap();
        let stacks = Arc::new(Stacks::new(Arc::new(backend), 3, 1024, 256, false));
        for (text, embedding, topic) in entries {
            let mut meta = HashMap::new();
            meta.insert("topic".to_string(), topic.to_string());
            stacks
                .add(text.to_string(), embedding.to_vec(), meta, 1_000)
                .await
                .unwrap();
        }
        (dir, stacks)
    }

    #[tokio::test]
    async fn empty_embedding_returns_no_results() {
        let (_dir, stacks) = stacks_with(&[("apple", &[1.0, 0.0, 0.0], "t")]).await;
        let search = StacksSearch::new(stacks);
        let results = search.vector_search(&[], &SearchOptions::default(), 0).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine_similarity() {
        let (_dir, stacks) = stacks_with(&[
            ("a", &[1.0, 0.0, 0.0], "t"),
            ("b", &[0.0, 1.0, 0.0], "t"),
        ])
        .await;
        let search = StacksSearch::new(stacks);
        let options = SearchOptions::with_defaults(10, 0.0, 0.6);
        let results = search.vector_search(&[1.0, 0.0, 0.0], &options, 0).await;

        assert_eq!(results[0].volume.text, "a");
    }

    #[tokio::test]
    async fn text_search_ranks_by_bm25() {
        let (_dir, stacks) = stacks_with(&[
            ("apple", &[1.0, 0.0, 0.0], "t"),
            ("apple banana", &[0.0, 1.0, 0.0], "t"),
        ])
        .await;
        let search = StacksSearch::new(stacks);
        let options = SearchOptions::with_defaults(10, 0.0, 0.6);
        let results = search.text_search("apple banana", &options).await;
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn query_dsl_splits_free_text_from_filters() {
        let parsed = parse_query("rust async +tag:backend after:2025-01-01 score>0.5");
        assert_eq!(parsed.text, "rust async");
        assert_eq!(parsed.metadata_filters.len(), 2);
        assert!(parsed.date_range.is_some());
    }
}
