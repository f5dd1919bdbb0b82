use std::collections::{BTreeSet, HashMap, HashSet};

use crate::inverted_index::tokenize;

/// Common English stopwords filtered out of auto-extraction. Not
/// exhaustive; enough to keep the highest-frequency remaining tokens
/// meaningful.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "being",
    "to", "of", "in", "on", "for", "with", "as", "by", "at", "it", "this", "that", "these",
    "those", "i", "you", "he", "she", "we", "they", "my", "your", "his", "her", "its", "our",
    "their", "not", "no", "so", "do", "does", "did", "have", "has", "had", "can", "will",
    "would", "should", "could", "about", "into", "than", "then", "there", "here",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Pick the highest-frequency non-stopword tokens as a fallback topic list
/// when a Volume carries no `topic`/`topics` metadata.
pub fn auto_extract_topics(text: &str, max_topics: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        if token.len() < 3 || is_stopword(&token) {
            continue;
        }
        *counts.entry(token).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(max_topics)
        .map(|(term, _)| term)
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct TopicNode {
    pub entries: BTreeSet<String>,
    pub co_occurrence: HashMap<String, u64>,
}

/// Hierarchical topic tree keyed by the full slashed path. Adding a leaf
/// implicitly creates all ancestors.
#[derive(Debug, Default)]
pub struct TopicIndex {
    nodes: HashMap<String, TopicNode>,
}

fn ancestors(topic: &str) -> Vec<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    (1..=parts.len())
        .map(|i| parts[..i].join("/"))
        .collect()
}

/// True when `a` and `b` are the same topic or one is an ancestor of the
/// other. Co-occurrence only ever applies to sibling/unrelated topics, never
/// parent/child pairs.
fn is_ancestor_or_descendant(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

/// The leaf topics a Volume resolves to: `declared` if non-empty, else
/// auto-extraction from `text`. Exposed standalone so callers can
/// denormalize `Volume.topics` without duplicating the fallback logic.
pub fn resolve_topics(declared: &[String], text: &str) -> Vec<String> {
    if !declared.is_empty() {
        declared.to_vec()
    } else {
        auto_extract_topics(text, 3)
    }
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_node(&mut self, topic: &str) -> &mut TopicNode {
        self.nodes.entry(topic.to_string()).or_default()
    }

    /// Topics come from `metadata.topics` (JSON array) if present, else
    /// `metadata.topic`, else auto-extraction from `text`. Every ancestor of
    /// every topic is created idempotently. Co-occurrence is only bumped
    /// between the declared leaf topics themselves (never an ancestor and
    /// its own descendant), since a parent/child pair is not a sibling
    /// relationship. Returns the full ancestor-expanded path set actually
    /// populated, so callers can pass the same set back to `remove_entry`.
    pub fn add_entry(&mut self, id: &str, declared_topics: &[String], text: &str) -> Vec<String> {
        let topics: Vec<String> = if !declared_topics.is_empty() {
            declared_topics.to_vec()
        } else {
            auto_extract_topics(text, 3)
        };

        let mut full_paths: HashSet<String> = HashSet::new();
        for topic in &topics {
            for ancestor in ancestors(topic) {
                full_paths.insert(ancestor);
            }
        }

        for path in &full_paths {
            self.ensure_node(path).entries.insert(id.to_string());
        }

        for i in 0..topics.len() {
            for j in (i + 1)..topics.len() {
                if is_ancestor_or_descendant(&topics[i], &topics[j]) {
                    continue;
                }
                self.bump_co_occurrence(&topics[i], &topics[j]);
            }
        }

        full_paths.into_iter().collect()
    }

    fn bump_co_occurrence(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        *self
            .ensure_node(a)
            .co_occurrence
            .entry(b.to_string())
            .or_insert(0) += 1;
        *self
            .ensure_node(b)
            .co_occurrence
            .entry(a.to_string())
            .or_insert(0) += 1;
    }

    /// Decrements co-occurrence counts symmetrically between the declared
    /// leaf `topics` (mirroring what `add_entry` bumps — ancestor/descendant
    /// pairs are never counted) and removes `id` from every node
    /// `add_entry` populated for those topics, i.e. `topics` themselves
    /// *and* every one of their ancestors. Without re-deriving ancestors
    /// here, `id` would stay stuck in an ancestor node's `entries` forever.
    pub fn remove_entry(&mut self, id: &str, topics: &[String]) {
        let mut full_paths: HashSet<String> = HashSet::new();
        for topic in topics {
            for ancestor in ancestors(topic) {
                full_paths.insert(ancestor);
            }
        }

        for path in &full_paths {
            if let Some(node) = self.nodes.get_mut(path) {
                node.entries.remove(id);
            }
        }

        for i in 0..topics.len() {
            for j in (i + 1)..topics.len() {
                if is_ancestor_or_descendant(&topics[i], &topics[j]) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&topics[i]) {
                    if let Some(count) = node.co_occurrence.get_mut(&topics[j]) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            node.co_occurrence.remove(&topics[j]);
                        }
                    }
                }
                if let Some(node) = self.nodes.get_mut(&topics[j]) {
                    if let Some(count) = node.co_occurrence.get_mut(&topics[i]) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            node.co_occurrence.remove(&topics[i]);
                        }
                    }
                }
            }
        }
    }

    pub fn get_entries(&self, topic: &str) -> BTreeSet<String> {
        self.nodes
            .get(topic)
            .map(|n| n.entries.clone())
            .unwrap_or_default()
    }

    pub fn get_children(&self, topic: &str) -> BTreeSet<String> {
        let prefix = format!("{topic}/");
        self.nodes
            .keys()
            .filter(|k| {
                k.starts_with(&prefix) && !k[prefix.len()..].contains('/')
            })
            .cloned()
            .collect()
    }

    pub fn get_all_topics(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Pairs sorted by co-occurrence count descending, ties broken by topic
    /// name ascending.
    pub fn get_related_topics(&self, topic: &str) -> Vec<(String, u64)> {
        let Some(node) = self.nodes.get(topic) else {
            return Vec::new();
        };
        let mut pairs: Vec<(String, u64)> = node
            .co_occurrence
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pairs
    }

    /// Creates `topic` (and its ancestors) with no entries, if absent.
    /// Used by reorganization plans that introduce a subtopic ahead of any
    /// Volume being filed under it.
    pub fn create_topic(&mut self, topic: &str) {
        for ancestor in ancestors(topic) {
            self.ensure_node(&ancestor);
        }
    }

    pub fn co_occurrence(&self, a: &str, b: &str) -> u64 {
        self.nodes
            .get(a)
            .and_then(|n| n.co_occurrence.get(b))
            .copied()
            .unwrap_or(0)
    }

    /// Moves all ids from `from` to `to`, merges co-occurrence edges
    /// (summing counts), and retains `from` as an empty node for
    /// provenance. Idempotent when `from == to`.
    pub fn merge_topic(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }

        let from_node = self.nodes.remove(from).unwrap_or_default();
        let to_node = self.ensure_node(to);
        for id in &from_node.entries {
            to_node.entries.insert(id.clone());
        }
        for (topic, count) in from_node.co_occurrence {
            if topic == to {
                continue;
            }
            *to_node.co_occurrence.entry(topic).or_insert(0) += count;
        }

        self.nodes.insert(from.to_string(), TopicNode::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_leaf_creates_ancestors() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["programming/rust".to_string()], "text");

        assert!(idx.get_entries("programming").contains("v1"));
        assert!(idx.get_entries("programming/rust").contains("v1"));
        assert!(idx.get_all_topics().contains("programming"));
    }

    #[test]
    fn hierarchical_scenario_s2() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["programming/rust".to_string()], "text");
        idx.add_entry("v2", &["programming/python".to_string()], "text");
        idx.add_entry("v3", &["cooking/italian".to_string()], "text");

        let programming = idx.get_entries("programming");
        assert!(programming.contains("v1") && programming.contains("v2"));
        assert!(!programming.contains("v3"));

        let children = idx.get_children("programming");
        assert!(children.contains("programming/rust"));
        assert!(children.contains("programming/python"));

        assert!(idx.get_all_topics().contains("cooking"));
    }

    #[test]
    fn co_occurrence_is_symmetric() {
        let mut idx = TopicIndex::new();
        idx.add_entry(
            "v1",
            &["a".to_string(), "b".to_string()],
            "text",
        );
        assert_eq!(idx.co_occurrence("a", "b"), idx.co_occurrence("b", "a"));
        assert!(idx.co_occurrence("a", "b") > 0);
    }

    #[test]
    fn remove_entry_clears_the_id_from_every_ancestor_it_populated() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["programming/rust".to_string()], "text");
        assert!(idx.get_entries("programming").contains("v1"));

        idx.remove_entry("v1", &["programming/rust".to_string()]);

        assert!(!idx.get_entries("programming").contains("v1"));
        assert!(!idx.get_entries("programming/rust").contains("v1"));
    }

    #[test]
    fn ancestor_descendant_pairs_never_count_as_co_occurrence() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["programming/rust".to_string()], "text");

        assert_eq!(idx.co_occurrence("programming", "programming/rust"), 0);
        assert_eq!(idx.co_occurrence("programming/rust", "programming"), 0);
    }

    #[test]
    fn remove_entry_decrements_only_leaf_co_occurrence() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["a".to_string(), "b".to_string()], "text");
        assert_eq!(idx.co_occurrence("a", "b"), 1);

        idx.remove_entry("v1", &["a".to_string(), "b".to_string()]);
        assert_eq!(idx.co_occurrence("a", "b"), 0);
    }

    #[test]
    fn merge_topic_moves_entries_and_is_idempotent_on_self_merge() {
        let mut idx = TopicIndex::new();
        idx.add_entry("v1", &["from".to_string()], "text");
        idx.add_entry("v2", &["to".to_string()], "text");

        idx.merge_topic("from", "from");
        assert!(idx.get_entries("from").contains("v1"));

        idx.merge_topic("from", "to");
        assert!(idx.get_entries("from").is_empty());
        assert!(idx.get_entries("to").contains("v1"));
        assert!(idx.get_entries("to").contains("v2"));
    }

    #[test]
    fn create_topic_adds_an_empty_node_and_its_ancestors() {
        let mut idx = TopicIndex::new();
        idx.create_topic("programming/rust/async");
        assert!(idx.get_all_topics().contains("programming"));
        assert!(idx.get_all_topics().contains("programming/rust"));
        assert!(idx.get_entries("programming/rust/async").is_empty());
    }

    #[test]
    fn auto_extraction_skips_stopwords() {
        let topics = auto_extract_topics("the quick brown fox jumps over the lazy dog", 3);
        assert!(!topics.contains(&"the".to_string()));
        assert!(!topics.is_empty());
    }
}
