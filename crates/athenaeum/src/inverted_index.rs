use std::collections::{HashMap, HashSet};

/// Lowercase, replace non-word/non-space characters with spaces, split on
/// whitespace, drop empties. Deterministic and pure so tests (and BM25
/// monotonicity checks) can call it directly.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    normalized
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Tokenize, postings lists, Okapi BM25 scoring over volume text.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<String, HashSet<String>>,
    doc_token_count: HashMap<String, usize>,
    term_doc_freq: HashMap<String, HashMap<String, usize>>,
    total_tokens: usize,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, id: &str, text: &str) {
        let tokens = tokenize(text);
        self.doc_token_count.insert(id.to_string(), tokens.len());
        self.total_tokens += tokens.len();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_insert(0) += 1;
        }

        for (term, count) in counts {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
            self.term_doc_freq
                .entry(term)
                .or_default()
                .insert(id.to_string(), count);
        }
    }

    /// Requires the original text so co-occurring terms are cleaned exactly
    /// once regardless of repetition.
    pub fn remove_entry(&mut self, id: &str, text: &str) {
        let tokens: HashSet<String> = tokenize(text).into_iter().collect();
        if let Some(removed_count) = self.doc_token_count.remove(id) {
            self.total_tokens = self.total_tokens.saturating_sub(removed_count);
        }

        for term in tokens {
            if let Some(docs) = self.postings.get_mut(&term) {
                docs.remove(id);
                if docs.is_empty() {
                    self.postings.remove(&term);
                }
            }
            if let Some(doc_freqs) = self.term_doc_freq.get_mut(&term) {
                doc_freqs.remove(id);
                if doc_freqs.is_empty() {
                    self.term_doc_freq.remove(&term);
                }
            }
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_token_count.len()
    }

    fn avg_doc_len(&self) -> f32 {
        let n = self.doc_token_count.len();
        if n == 0 {
            return 0.0;
        }
        self.total_tokens as f32 / n as f32
    }

    /// Returns `(id, score)` pairs sorted by score descending, ties broken
    /// by id ascending. Empty index or empty query yields `[]`.
    pub fn bm25_search(&self, query: &str, params: Bm25Params) -> Vec<(String, f32)> {
        let n = self.doc_token_count.len();
        if n == 0 {
            return Vec::new();
        }

        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let avgdl = self.avg_doc_len();
        let mut scores: HashMap<String, f32> = HashMap::new();

        let mut seen_terms = HashSet::new();
        for term in &query_terms {
            if !seen_terms.insert(term.clone()) {
                continue;
            }
            let Some(doc_freqs) = self.term_doc_freq.get(term) else {
                continue;
            };
            let df = doc_freqs.len();
            let idf = ((n as f32 - df as f32 + 0.5) / (df as f32 + 0.5) + 1.0).ln();

            for (doc_id, &tf) in doc_freqs {
                let dl = *self.doc_token_count.get(doc_id).unwrap_or(&0) as f32;
                let tf = tf as f32;
                let tf_norm =
                    tf * (params.k1 + 1.0) / (tf + params.k1 * (1.0 - params.b + params.b * dl / avgdl.max(1.0)));
                *scores.entry(doc_id.clone()).or_insert(0.0) += idf * tf_norm;
            }
        }

        let mut results: Vec<(String, f32)> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_strips_punctuation() {
        assert_eq!(
            tokenize("Hello, World! Foo-Bar"),
            vec!["hello", "world", "foo", "bar"]
        );
    }

    #[test]
    fn empty_query_returns_empty() {
        let mut idx = InvertedIndex::new();
        idx.add_entry("a", "apple banana");
        assert!(idx.bm25_search("", Bm25Params::default()).is_empty());
    }

    #[test]
    fn empty_index_returns_empty() {
        let idx = InvertedIndex::new();
        assert!(idx.bm25_search("apple", Bm25Params::default()).is_empty());
    }

    #[test]
    fn ranks_higher_overlap_above_lower() {
        let mut idx = InvertedIndex::new();
        idx.add_entry("a", "apple");
        idx.add_entry("b", "apple banana");
        idx.add_entry("c", "apple banana cherry");

        let results = idx.bm25_search("apple banana", Bm25Params::default());
        let order: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        let pos_a = order.iter().position(|&x| x == "a").unwrap();
        let pos_b = order.iter().position(|&x| x == "b").unwrap();
        let pos_c = order.iter().position(|&x| x == "c").unwrap();
        assert!(pos_b < pos_a);
        assert!(pos_c < pos_a);
    }

    #[test]
    fn remove_entry_cleans_postings() {
        let mut idx = InvertedIndex::new();
        idx.add_entry("a", "apple apple banana");
        idx.remove_entry("a", "apple apple banana");
        assert_eq!(idx.doc_count(), 0);
        assert!(idx.bm25_search("apple", Bm25Params::default()).is_empty());
    }

    #[test]
    fn adding_matching_volume_never_lowers_existing_top_score() {
        let mut idx = InvertedIndex::new();
        idx.add_entry("a", "apple banana");
        let before = idx
            .bm25_search("apple banana", Bm25Params::default())
            .into_iter()
            .find(|(id, _)| id == "a")
            .map(|(_, s)| s)
            .unwrap();

        idx.add_entry("b", "apple banana cherry");
        let after = idx
            .bm25_search("apple banana", Bm25Params::default())
            .into_iter()
            .find(|(id, _)| id == "a")
            .map(|(_, s)| s)
            .unwrap();

        assert!(after >= before - 1e-4);
    }
}
