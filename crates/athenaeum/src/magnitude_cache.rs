use std::collections::HashMap;

use crate::cosine::magnitude;

/// Memoized `‖v‖` per Volume id. Reads are cheap lookups; writes must be
/// serialized with the owning Stacks write lock.
#[derive(Debug, Default)]
pub struct MagnitudeCache {
    norms: HashMap<String, f32>,
}

impl MagnitudeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: &str, embedding: &[f32]) {
        self.norms.insert(id.to_string(), magnitude(embedding));
    }

    pub fn get(&self, id: &str) -> Option<f32> {
        self.norms.get(id).copied()
    }

    pub fn invalidate(&mut self, id: &str) {
        self.norms.remove(id);
    }

    pub fn clear(&mut self) {
        self.norms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_matches_raw_magnitude() {
        let mut cache = MagnitudeCache::new();
        cache.set("a", &[3.0, 4.0]);
        assert_eq!(cache.get("a"), Some(5.0));
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut cache = MagnitudeCache::new();
        cache.set("a", &[3.0, 4.0]);
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
    }
}
