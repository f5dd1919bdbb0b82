use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::cosine::cosine_similarity;

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub existing_id: Option<String>,
}

/// SHA-256 hex digest of the lowercased, whitespace-collapsed text — used
/// both for fingerprint equality and as the dedup key stored alongside
/// each volume, so two Volumes differing only in case/spacing hash equal
/// without keeping their full text around for comparison.
pub fn fingerprint(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Near-duplicate detection by cosine similarity and text fingerprint.
///
/// Callers own the candidate set (`id -> (embedding, fingerprint)`); Stacks
/// is the natural owner of that data and feeds it in rather than this type
/// holding a second copy.
pub struct Deduplication {
    threshold: f32,
}

impl Deduplication {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn check_duplicate(
        &self,
        text: &str,
        embedding: &[f32],
        candidates: &HashMap<String, (Vec<f32>, String)>,
    ) -> DuplicateCheck {
        let incoming_fingerprint = fingerprint(text);

        for (id, (candidate_embedding, candidate_fingerprint)) in candidates {
            if candidate_fingerprint == &incoming_fingerprint {
                return DuplicateCheck {
                    is_duplicate: true,
                    existing_id: Some(id.clone()),
                };
            }
            if cosine_similarity(embedding, candidate_embedding) >= self.threshold {
                return DuplicateCheck {
                    is_duplicate: true,
                    existing_id: Some(id.clone()),
                };
            }
        }

        DuplicateCheck {
            is_duplicate: false,
            existing_id: None,
        }
    }

    /// Groups of mutually-duplicate ids, used by a Librarian's `optimize`.
    pub fn find_duplicate_volumes(
        &self,
        candidates: &HashMap<String, (Vec<f32>, String)>,
        threshold: f32,
    ) -> Vec<Vec<String>> {
        let mut ids: Vec<&String> = candidates.keys().collect();
        ids.sort();

        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut groups = Vec::new();

        for &id in &ids {
            if visited.contains(id) {
                continue;
            }
            let (embedding, fp) = &candidates[id];
            let mut group = vec![id.clone()];
            visited.insert(id.clone());

            for &other in &ids {
                if other == id || visited.contains(other) {
                    continue;
                }
                let (other_embedding, other_fp) = &candidates[other];
                if fp == other_fp || cosine_similarity(embedding, other_embedding) >= threshold {
                    group.push(other.clone());
                    visited.insert(other.clone());
                }
            }

            if group.len() > 1 {
                groups.push(group);
            }
        }

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_is_flagged_via_fingerprint() {
        let dedup = Deduplication::new(0.97);
        let mut candidates = HashMap::new();
        candidates.insert(
            "id1".to_string(),
            (vec![1.0, 0.0], fingerprint("Use bun test")),
        );

        let result = dedup.check_duplicate("Use bun test", &[0.0, 1.0], &candidates);
        assert_eq!(
            result,
            DuplicateCheck {
                is_duplicate: true,
                existing_id: Some("id1".to_string())
            }
        );
    }

    #[test]
    fn dedup_is_symmetric_for_identical_text() {
        let dedup = Deduplication::new(0.97);
        let mut candidates = HashMap::new();
        candidates.insert("id1".to_string(), (vec![1.0, 0.0], fingerprint("hello world")));
        let check = dedup.check_duplicate("hello world", &[1.0, 0.0], &candidates);
        assert!(check.is_duplicate);
    }

    #[test]
    fn high_cosine_similarity_flags_duplicate() {
        let dedup = Deduplication::new(0.9);
        let mut candidates = HashMap::new();
        candidates.insert(
            "id1".to_string(),
            (vec![1.0, 0.0, 0.0], fingerprint("alpha")),
        );
        let result = dedup.check_duplicate("beta", &[0.99, 0.01, 0.0], &candidates);
        assert!(result.is_duplicate);
    }

    #[test]
    fn distinct_text_and_embedding_is_not_duplicate() {
        let dedup = Deduplication::new(0.97);
        let mut candidates = HashMap::new();
        candidates.insert("id1".to_string(), (vec![1.0, 0.0], fingerprint("alpha")));
        let result = dedup.check_duplicate("omega", &[0.0, 1.0], &candidates);
        assert!(!result.is_duplicate);
    }
}
