use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::dedup::fingerprint;
use crate::error::{AthenaeumError, Result};
use crate::inverted_index::InvertedIndex;
use crate::learning::LearningState;
use crate::magnitude_cache::MagnitudeCache;
use crate::preservation::{decode_volume, encode_volume};
use crate::schema::{is_reserved_id, Volume, LEARNING_SENTINEL_KEY};
use crate::storage::{write_corrupt_sidecar, StorageBackend};
use crate::text_cache::TextCache;
use crate::topic_index::{resolve_topics, TopicIndex};

pub const SCHEMA_VERSION: u32 = 2;
const ID_LENGTH: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadReport {
    pub loaded: usize,
    pub corrupt: usize,
    pub learning_restored: bool,
}

struct StacksState {
    volumes: HashMap<String, Volume>,
    inverted: InvertedIndex,
    topics: TopicIndex,
    magnitude: MagnitudeCache,
    text_cache: TextCache,
    learning: LearningState,
    dirty: bool,
}

impl StacksState {
    fn new(text_cache_capacity: usize) -> Self {
        Self {
            volumes: HashMap::new(),
            inverted: InvertedIndex::new(),
            topics: TopicIndex::new(),
            magnitude: MagnitudeCache::new(),
            text_cache: TextCache::new(text_cache_capacity),
            learning: LearningState::default(),
            dirty: false,
        }
    }
}

/// The canonical Volume store: CRUD, persistence, compaction.
pub struct Stacks {
    backend: Arc<dyn StorageBackend>,
    expected_dim: usize,
    gzip_threshold: usize,
    auto_save: bool,
    state: RwLock<StacksState>,
}

impl Stacks {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        expected_dim: usize,
        gzip_threshold: usize,
        text_cache_capacity: usize,
        auto_save: bool,
    ) -> Self {
        Self {
            backend,
            expected_dim,
            gzip_threshold,
            auto_save,
            state: RwLock::new(StacksState::new(text_cache_capacity)),
        }
    }

    /// Decode every entry, validate schema, skip corrupt entries with a
    /// counter, restore access stats, attempt to restore `LearningState`.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<LoadReport> {
        let raw = self.backend.load().await?;
        let mut state = self.state.write().await;
        *state = StacksState::new(state.text_cache.len().max(crate::text_cache::DEFAULT_CAPACITY));

        let mut report = LoadReport::default();

        for (id, bytes) in &raw {
            if id == LEARNING_SENTINEL_KEY {
                continue;
            }
            match decode_volume(id, bytes) {
                Ok(mut volume) => {
                    let leaves = resolve_topics(&volume.declared_topics(), &volume.text);
                    volume.topics = leaves.iter().cloned().collect();

                    state.inverted.add_entry(id, &volume.text);
                    state.topics.add_entry(id, &leaves, &volume.text);
                    state.magnitude.set(id, &volume.embedding);

                    state.volumes.insert(id.clone(), volume);
                    report.loaded += 1;
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "skipping corrupt stacks entry");
                    if let Some(data_path) = self.backend.data_path() {
                        if let Err(sidecar_err) =
                            write_corrupt_sidecar(data_path, id, bytes, &err.to_string())
                        {
                            warn!(error = %sidecar_err, "failed to write corrupt sidecar");
                        }
                    }
                    report.corrupt += 1;
                }
            }
        }

        if let Some(learning_bytes) = raw.get(LEARNING_SENTINEL_KEY) {
            match serde_json::from_slice::<LearningState>(learning_bytes) {
                Ok(learning) => {
                    state.learning = learning;
                    report.learning_restored = true;
                }
                Err(err) => {
                    warn!(error = %err, "learning state corrupt, starting fresh");
                    state.learning = LearningState::default();
                }
            }
        }

        Ok(report)
    }

    /// Assigns a random 8-character collision-checked id.
    fn generate_id(existing: &HashMap<String, Volume>) -> String {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ID_LENGTH)
                .map(char::from)
                .collect();
            let id = id.to_lowercase();
            if !existing.contains_key(&id) && !is_reserved_id(&id) {
                return id;
            }
        }
    }

    #[instrument(skip(self, text, embedding, metadata))]
    pub async fn add(
        &self,
        text: String,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
        now_ms: i64,
    ) -> Result<String> {
        if embedding.len() != self.expected_dim {
            return Err(AthenaeumError::Embedding(format!(
                "expected embedding dimension {}, got {}",
                self.expected_dim,
                embedding.len()
            )));
        }

        let mut state = self.state.write().await;
        let id = Self::generate_id(&state.volumes);

        let declared: Vec<String> = {
            // Resolve against a throwaway Volume so `declared_topics()` logic
            // is shared with the persisted representation.
            let scratch = Volume {
                id: id.clone(),
                text: text.clone(),
                embedding: embedding.clone(),
                metadata: metadata.clone(),
                timestamp: now_ms,
                access_count: 0,
                last_accessed: now_ms,
                topics: Default::default(),
            };
            scratch.declared_topics()
        };
        let leaves = resolve_topics(&declared, &text);

        let volume = Volume {
            id: id.clone(),
            text: text.clone(),
            embedding: embedding.clone(),
            metadata,
            timestamp: now_ms,
            access_count: 0,
            last_accessed: now_ms,
            topics: leaves.iter().cloned().collect(),
        };

        state.inverted.add_entry(&id, &text);
        state.topics.add_entry(&id, &leaves, &text);
        state.magnitude.set(&id, &embedding);
        state.text_cache.put(&id, text);
        state.volumes.insert(id.clone(), volume);
        state.dirty = true;

        drop(state);
        if self.auto_save {
            self.flush().await?;
        }

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<Volume> {
        let state = self.state.read().await;
        state.volumes.get(id).cloned()
    }

    /// Bumps `accessCount`/`lastAccessed`. Monotonically non-decreasing per
    /// id even if bumps from concurrent reads interleave.
    pub async fn bump_access(&self, id: &str, now_ms: i64) {
        let mut state = self.state.write().await;
        if let Some(volume) = state.volumes.get_mut(id) {
            volume.access_count += 1;
            volume.last_accessed = volume.last_accessed.max(now_ms);
            state.dirty = true;
        }
    }

    /// Replaces text/metadata/embedding atomically; removes stale tokens
    /// before adding fresh ones; invalidates magnitude & text caches.
    #[instrument(skip(self, text, embedding, metadata))]
    pub async fn update(
        &self,
        id: &str,
        text: Option<String>,
        embedding: Option<Vec<f32>>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<bool> {
        if let Some(ref embedding) = embedding {
            if embedding.len() != self.expected_dim {
                return Err(AthenaeumError::Embedding(format!(
                    "expected embedding dimension {}, got {}",
                    self.expected_dim,
                    embedding.len()
                )));
            }
        }

        let mut state = self.state.write().await;
        let Some(existing) = state.volumes.get(id).cloned() else {
            return Ok(false);
        };

        let old_text = existing.text.clone();
        let old_leaves: Vec<String> = existing.topics.iter().cloned().collect();

        let new_text = text.unwrap_or(existing.text);
        let new_embedding = embedding.unwrap_or(existing.embedding);
        let new_metadata = metadata.unwrap_or(existing.metadata);

        state.inverted.remove_entry(id, &old_text);
        state.topics.remove_entry(id, &old_leaves);

        let scratch = Volume {
            id: id.to_string(),
            text: new_text.clone(),
            embedding: new_embedding.clone(),
            metadata: new_metadata.clone(),
            timestamp: existing.timestamp,
            access_count: existing.access_count,
            last_accessed: existing.last_accessed,
            topics: Default::default(),
        };
        let declared = scratch.declared_topics();
        let new_leaves = resolve_topics(&declared, &new_text);

        state.inverted.add_entry(id, &new_text);
        state.topics.add_entry(id, &new_leaves, &new_text);
        state.magnitude.invalidate(id);
        state.magnitude.set(id, &new_embedding);
        state.text_cache.invalidate(id);
        state.text_cache.put(id, new_text.clone());

        let updated = Volume {
            id: id.to_string(),
            text: new_text,
            embedding: new_embedding,
            metadata: new_metadata,
            timestamp: existing.timestamp,
            access_count: existing.access_count,
            last_accessed: existing.last_accessed,
            topics: new_leaves.into_iter().collect(),
        };
        state.volumes.insert(id.to_string(), updated);
        state.dirty = true;

        drop(state);
        if self.auto_save {
            self.flush().await?;
        }

        Ok(true)
    }

    /// Removes from all indices and caches. The id is never reused.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(volume) = state.volumes.remove(id) else {
            return Ok(false);
        };

        let leaves: Vec<String> = volume.topics.iter().cloned().collect();
        state.inverted.remove_entry(id, &volume.text);
        state.topics.remove_entry(id, &leaves);
        state.magnitude.invalidate(id);
        state.text_cache.invalidate(id);
        state.dirty = true;

        drop(state);
        if self.auto_save {
            self.flush().await?;
        }

        Ok(true)
    }

    /// Empties every index and the KV map; preserves the schema version.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let capacity = state.text_cache.len().max(crate::text_cache::DEFAULT_CAPACITY);
        *state = StacksState::new(capacity);
        state.dirty = true;

        drop(state);
        if self.auto_save {
            self.flush().await?;
        }

        Ok(())
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.volumes.len()
    }

    pub async fn all(&self) -> Vec<Volume> {
        self.state.read().await.volumes.values().cloned().collect()
    }

    pub async fn magnitude(&self, id: &str) -> Option<f32> {
        self.state.read().await.magnitude.get(id)
    }

    pub async fn topic_entries(&self, topic: &str) -> std::collections::BTreeSet<String> {
        self.state.read().await.topics.get_entries(topic)
    }

    pub async fn topic_children(&self, topic: &str) -> std::collections::BTreeSet<String> {
        self.state.read().await.topics.get_children(topic)
    }

    pub async fn all_topics(&self) -> std::collections::BTreeSet<String> {
        self.state.read().await.topics.get_all_topics()
    }

    pub async fn related_topics(&self, topic: &str) -> Vec<(String, u64)> {
        self.state.read().await.topics.get_related_topics(topic)
    }

    pub async fn merge_topic(&self, from: &str, to: &str) {
        self.state.write().await.topics.merge_topic(from, to);
    }

    pub async fn create_topic(&self, topic: &str) {
        self.state.write().await.topics.create_topic(topic);
    }

    pub async fn bm25_search(
        &self,
        query: &str,
        params: crate::inverted_index::Bm25Params,
    ) -> Vec<(String, f32)> {
        self.state.read().await.inverted.bm25_search(query, params)
    }

    pub async fn learning_state(&self) -> LearningState {
        self.state.read().await.learning.clone()
    }

    pub async fn set_learning_state(&self, state: LearningState) {
        self.state.write().await.learning = state;
    }

    pub async fn fingerprints(&self) -> HashMap<String, (Vec<f32>, String)> {
        let state = self.state.read().await;
        state
            .volumes
            .iter()
            .map(|(id, v)| (id.clone(), (v.embedding.clone(), fingerprint(&v.text))))
            .collect()
    }

    /// Re-encodes every entry plus the learning sentinel and replaces the
    /// backend's entire map atomically. A no-op when nothing is dirty.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let mut encoded = HashMap::new();
        {
            let state = self.state.read().await;
            if !state.dirty {
                return Ok(());
            }
            for (id, volume) in &state.volumes {
                encoded.insert(id.clone(), encode_volume(volume, self.gzip_threshold)?);
            }
            let learning_bytes = serde_json::to_vec(&state.learning).map_err(|e| {
                AthenaeumError::Stacks(format!("failed to serialize learning state: {e}"))
            })?;
            encoded.insert(LEARNING_SENTINEL_KEY.to_string(), learning_bytes);
        }

        self.backend.save(&encoded).await?;
        self.state.write().await.dirty = false;
        Ok(())
    }

    /// Flushes synchronously (no deferral) and releases the backend.
    pub async fn dispose(&self) -> Result<()> {
        self.flush().await?;
        self.backend.close().await
    }

    /// Spawns the background flush timer described by `flushIntervalMs`
    /// (§4.6); `0` means the caller should not spawn a timer at all.
    pub fn spawn_flush_task(self: Arc<Self>, interval_ms: u64) -> Option<JoinHandle<()>> {
        if interval_ms == 0 {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                if let Err(err) = self.flush().await {
                    warn!(error = %err, "background stacks flush failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorageBackend;

    async fn new_stacks() -> (tempfile::TempDir, Stacks) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::open(dir.path().join("stacks.redb")).unwrap();
        let stacks = Stacks::new(Arc::new(backend), 3, 1024, 256, false);
        (dir, stacks)
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let (_dir, stacks) = new_stacks().await;
        let id = stacks
            .add("hello".to_string(), vec![1.0, 0.0, 0.0], HashMap::new(), 1000)
            .await
            .unwrap();

        let volume = stacks.get(&id).await.unwrap();
        assert_eq!(volume.text, "hello");
        assert_eq!(stacks.size().await, 1);
    }

    #[tokio::test]
    async fn add_rejects_wrong_dimension() {
        let (_dir, stacks) = new_stacks().await;
        let result = stacks
            .add("hello".to_string(), vec![1.0, 0.0], HashMap::new(), 1000)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_then_add_returns_store_to_prior_state() {
        let (_dir, stacks) = new_stacks().await;
        let id = stacks
            .add("hello".to_string(), vec![1.0, 0.0, 0.0], HashMap::new(), 1000)
            .await
            .unwrap();
        stacks.delete(&id).await.unwrap();

        assert_eq!(stacks.size().await, 0);
        assert!(stacks.bm25_search("hello", Default::default()).await.is_empty());
        assert_eq!(stacks.magnitude(&id).await, None);
    }

    #[tokio::test]
    async fn deleted_ids_are_never_reused_within_a_session() {
        let (_dir, stacks) = new_stacks().await;
        let id = stacks
            .add("hello".to_string(), vec![1.0, 0.0, 0.0], HashMap::new(), 1000)
            .await
            .unwrap();
        stacks.delete(&id).await.unwrap();

        for _ in 0..50 {
            let other = stacks
                .add("world".to_string(), vec![0.0, 1.0, 0.0], HashMap::new(), 1000)
                .await
                .unwrap();
            assert_ne!(other, id);
            stacks.delete(&other).await.unwrap();
        }
    }

    #[tokio::test]
    async fn persistence_scenario_s7() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stacks.redb");

        {
            let backend = FileStorageBackend::open(&path).unwrap();
            let stacks = Stacks::new(Arc::new(backend), 3, 1024, 256, false);
            for i in 0..100 {
                stacks
                    .add(format!("entry {i}"), vec![1.0, 0.0, 0.0], HashMap::new(), 1000)
                    .await
                    .unwrap();
            }
            stacks.dispose().await.unwrap();
        }

        {
            let backend = FileStorageBackend::open(&path).unwrap();
            let stacks = Stacks::new(Arc::new(backend), 3, 1024, 256, false);
            let report = stacks.load().await.unwrap();
            assert_eq!(report.loaded, 100);
            assert_eq!(stacks.size().await, 100);
        }
    }

    #[tokio::test]
    async fn update_is_idempotent_on_repeat_with_same_values() {
        let (_dir, stacks) = new_stacks().await;
        let id = stacks
            .add("hello".to_string(), vec![1.0, 0.0, 0.0], HashMap::new(), 1000)
            .await
            .unwrap();

        stacks
            .update(&id, Some("hello world".to_string()), None, None)
            .await
            .unwrap();
        let first = stacks.get(&id).await.unwrap();

        stacks
            .update(&id, Some("hello world".to_string()), None, None)
            .await
            .unwrap();
        let second = stacks.get(&id).await.unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(first.topics, second.topics);
    }
}
