use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Reserved key under which the serialized `LearningState` lives alongside
/// entries in the same key-value map. No Volume may use this id.
pub const LEARNING_SENTINEL_KEY: &str = "__learning";

pub fn is_reserved_id(id: &str) -> bool {
    id.starts_with("__")
}

/// Recognized `entryType` values. Unrecognized strings pass through
/// untouched since `metadata` is otherwise a free-form string map.
pub mod entry_type {
    pub const FACT: &str = "fact";
    pub const PREFERENCE: &str = "preference";
    pub const COMPENDIUM: &str = "compendium";
    pub const CONVERSATION: &str = "conversation";
}

/// A stored unit of memory: text, its embedding, and a metadata bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: std::collections::HashMap<String, String>,
    /// Epoch milliseconds of creation.
    pub timestamp: i64,
    pub access_count: u64,
    /// Epoch milliseconds of the most recent retrieval, or `timestamp` if
    /// the Volume was never retrieved.
    pub last_accessed: i64,
    /// Derived, sorted set of topics denormalized from `metadata` on write.
    pub topics: BTreeSet<String>,
}

impl Volume {
    /// `metadata.topics` (JSON array) if present, else `metadata.topic`, else
    /// empty. Does not run auto-extraction; that is `TopicIndex`'s job.
    pub fn declared_topics(&self) -> Vec<String> {
        if let Some(raw) = self.metadata.get("topics") {
            if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
                return list;
            }
        }
        if let Some(topic) = self.metadata.get("topic") {
            return vec![topic.clone()];
        }
        Vec::new()
    }

    pub fn entry_type(&self) -> Option<&str> {
        self.metadata.get("entryType").map(String::as_str)
    }

    pub fn shelf(&self) -> Option<&str> {
        self.metadata.get("shelf").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(text: &str) -> Volume {
        Volume {
            id: "abc12345".into(),
            text: text.into(),
            embedding: vec![0.0; 4],
            metadata: Default::default(),
            timestamp: 0,
            access_count: 0,
            last_accessed: 0,
            topics: Default::default(),
        }
    }

    #[test]
    fn declared_topics_prefers_multi_topic_list() {
        let mut v = volume("x");
        v.metadata
            .insert("topics".into(), r#"["a/b","c"]"#.into());
        v.metadata.insert("topic".into(), "ignored".into());
        assert_eq!(v.declared_topics(), vec!["a/b".to_string(), "c".to_string()]);
    }

    #[test]
    fn declared_topics_falls_back_to_single_topic() {
        let mut v = volume("x");
        v.metadata.insert("topic".into(), "solo".into());
        assert_eq!(v.declared_topics(), vec!["solo".to_string()]);
    }

    #[test]
    fn reserved_ids_are_rejected() {
        assert!(is_reserved_id("__learning"));
        assert!(!is_reserved_id("ab3f9c12"));
    }
}
