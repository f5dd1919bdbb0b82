use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use athenaeum_config::AppConfig;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::circulation::CirculationDesk;
use crate::dedup::Deduplication;
use crate::error::{AthenaeumError, Result};
use crate::inverted_index::Bm25Params;
use crate::learning::{LearningConfig, LearningEngine, Weights};
use crate::librarian::LibrarianRegistry;
use crate::providers::{EmbeddingProvider, Event, EventSink};
use crate::recommend::{recommend_score, RecommendCandidate};
use crate::schema::{entry_type, Volume};
use crate::shelf::Shelf;
use crate::stacks::Stacks;
use crate::stacks_search::{SearchOptions, SearchResult, StacksSearch};
use crate::storage::FileStorageBackend;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct PatronProfile {
    pub adapted_weights: Weights,
    pub interest_embedding: Option<Vec<f32>>,
    pub total_queries: u64,
}

#[derive(Debug, Clone)]
pub struct CompendiumOptions {
    pub min_entries: usize,
    pub min_age_ms: i64,
    pub delete_originals: bool,
}

impl Default for CompendiumOptions {
    fn default() -> Self {
        Self {
            min_entries: 20,
            min_age_ms: 7 * 24 * 60 * 60 * 1000,
            delete_originals: true,
        }
    }
}

/// Orchestration facade composing Stacks, the search/recommendation layer,
/// the LearningEngine, and the LibrarianRegistry behind a single
/// interface.
pub struct Library {
    stacks: Arc<Stacks>,
    search: StacksSearch,
    dedup: Deduplication,
    learning: Mutex<LearningEngine>,
    pub registry: RwLock<LibrarianRegistry>,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    event_sink: Option<Arc<dyn EventSink>>,
    config: AppConfig,
    initialized: AtomicBool,
    flush_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    circulation: Mutex<Option<Arc<CirculationDesk>>>,
}

fn learning_config_from(config: &athenaeum_config::LearningConfig) -> LearningConfig {
    LearningConfig {
        adapt_every_n_queries: config.adapt_every_n_queries,
        query_history_capacity: config.query_history_capacity,
        coordinate_step: config.coordinate_step,
        negative_feedback_penalty: config.negative_feedback_penalty,
    }
}

impl Library {
    /// StorageBackend -> Stacks.load -> index rebuild -> LearningState
    /// restore -> background flush timer start.
    #[instrument(skip(embedding_provider))]
    pub async fn initialize(
        config: AppConfig,
        embedding_provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let backend = FileStorageBackend::open(data_dir.join("stacks.redb"))?;
        let stacks = Arc::new(Stacks::new(
            Arc::new(backend),
            config.embedding.expected_dim,
            config.embedding.gzip_threshold_bytes,
            256,
            config.storage.auto_save,
        ));

        let report = stacks.load().await?;
        info!(loaded = report.loaded, corrupt = report.corrupt, "stacks loaded");

        let learning_state = stacks.learning_state().await;
        let learning = LearningEngine::restore(learning_state, learning_config_from(&config.learning));

        let flush_handle = if config.storage.flush_interval_ms > 0 {
            std::sync::Mutex::new(stacks.clone().spawn_flush_task(config.storage.flush_interval_ms))
        } else {
            std::sync::Mutex::new(None)
        };

        Ok(Self {
            search: StacksSearch::new(stacks.clone()),
            dedup: Deduplication::new(config.dedup.cosine_threshold),
            learning: Mutex::new(learning),
            registry: RwLock::new(LibrarianRegistry::new()),
            stacks,
            embedding_provider,
            event_sink: None,
            config,
            initialized: AtomicBool::new(true),
            flush_handle,
            circulation: Mutex::new(None),
        })
    }

    /// Attaches a `CirculationDesk` that `dispose` will drain and tear down
    /// before releasing the Stacks backend.
    pub async fn attach_circulation_desk(self: &Arc<Self>) -> Arc<CirculationDesk> {
        let desk = Arc::new(CirculationDesk::new(self.clone(), self.config.circulation.clone()));
        *self.circulation.lock().await = Some(desk.clone());
        desk
    }

    pub async fn circulation_desk(&self) -> Option<Arc<CirculationDesk>> {
        self.circulation.lock().await.clone()
    }

    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sink = Some(sink);
    }

    fn publish(&self, event: Event) {
        if let Some(sink) = &self.event_sink {
            sink.publish(event);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub async fn size(&self) -> usize {
        self.stacks.size().await
    }

    #[instrument(skip(self, text, metadata))]
    pub async fn add(&self, text: String, metadata: HashMap<String, String>) -> Result<String> {
        let embedding = self.embedding_provider.embed_one(&text).await?;
        let id = self.stacks.add(text, embedding, metadata, now_ms()).await?;
        info!(id = %id, "memory.add");
        self.publish(Event::MemoryAdd { id: id.clone() });
        Ok(id)
    }

    pub async fn add_batch(&self, items: Vec<(String, HashMap<String, String>)>) -> Result<Vec<String>> {
        let texts: Vec<String> = items.iter().map(|(text, _)| text.clone()).collect();
        let embeddings = self.embedding_provider.embed(&texts).await?;
        if embeddings.len() != items.len() {
            return Err(AthenaeumError::Embedding(
                "provider returned a different number of vectors than inputs".into(),
            ));
        }

        let mut ids = Vec::with_capacity(items.len());
        for ((text, metadata), embedding) in items.into_iter().zip(embeddings) {
            let id = self.stacks.add(text, embedding, metadata, now_ms()).await?;
            self.publish(Event::MemoryAdd { id: id.clone() });
            ids.push(id);
        }
        Ok(ids)
    }

    /// Raw cosine search, no recency/frequency blending.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Volume>> {
        let options = SearchOptions::with_defaults(max_results, self.config.search.similarity_threshold, self.config.search.hybrid_alpha);
        self.search_with_options(query, options).await
    }

    pub async fn search_with_options(&self, query: &str, options: SearchOptions) -> Result<Vec<Volume>> {
        let embedding = self.embedding_provider.embed_one(query).await?;
        let results = self.search.vector_search(&embedding, &options, now_ms()).await;
        info!(query, count = results.len(), "memory.search");
        self.publish(Event::MemorySearch { query: query.to_string(), result_count: results.len() });
        Ok(results.into_iter().map(|r| r.volume).collect())
    }

    pub async fn text_search(&self, query: &str, max_results: usize) -> Result<Vec<Volume>> {
        let options = SearchOptions::with_defaults(max_results, 0.0, self.config.search.hybrid_alpha);
        let results = self.search.text_search(query, &options).await;
        Ok(results.into_iter().map(|r| r.volume).collect())
    }

    /// Parses `query` as the `+tag:x -topic:y/z after:2025-01-01 score>0.5`
    /// DSL before delegating: the free-text remainder drives embedding/BM25
    /// scoring, while the parsed filters constrain the candidate set.
    pub async fn advanced_search(&self, query: &str, max_results: usize) -> Result<Vec<Volume>> {
        let parsed = crate::stacks_search::parse_query(query);
        let embedding = self.embedding_provider.embed_one(&parsed.text).await.ok();

        let mut options = SearchOptions::with_defaults(max_results, 0.0, self.config.search.hybrid_alpha);
        options.metadata_filters = parsed.metadata_filters.iter().chain(&parsed.topic_filters).cloned().collect();
        options.date_range = parsed.date_range;

        let results = self
            .search
            .advanced_search(&parsed.text, embedding.as_deref(), &options, now_ms())
            .await;
        Ok(results.into_iter().map(|r| r.volume).collect())
    }

    /// Vector similarity folded with recency and frequency, using the
    /// LearningEngine's current weight profile (or a per-topic profile).
    #[instrument(skip(self, query))]
    pub async fn recommend(
        &self,
        query: &str,
        max_results: usize,
        topic: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let embedding = self.embedding_provider.embed_one(query).await?;
        let mut options = SearchOptions::with_defaults(0, 0.0, self.config.search.hybrid_alpha);
        options.topic = topic.map(str::to_string);

        let vector_results = self.search.vector_search(&embedding, &options, now_ms()).await;
        let max_access_count = vector_results
            .iter()
            .map(|r| r.volume.access_count)
            .max()
            .unwrap_or(0);

        let weights = {
            let engine = self.learning.lock().await;
            engine.weights_for(topic)
        };
        let now = now_ms();

        let mut scored: Vec<SearchResult> = vector_results
            .into_iter()
            .map(|r| {
                let age_ms = now - r.volume.timestamp;
                let score = recommend_score(
                    RecommendCandidate {
                        vector_score: Some(r.score),
                        age_ms,
                        access_count: r.volume.access_count,
                    },
                    weights,
                    self.config.recommend.recency_half_life_ms,
                    max_access_count,
                );
                SearchResult { id: r.id, score, volume: r.volume }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let max_results = if max_results == 0 { scored.len() } else { max_results };
        scored.truncate(max_results);

        let top_score = scored.first().map(|r| r.score).unwrap_or(0.0);
        let result_ids: Vec<String> = scored.iter().map(|r| r.id.clone()).collect();
        {
            let mut engine = self.learning.lock().await;
            engine.record_retrieval(&result_ids, &embedding, now, top_score, topic);
            self.stacks.set_learning_state(engine.state.clone()).await;
        }

        Ok(scored)
    }

    pub async fn record_feedback(&self, id: &str, positive: bool) {
        let mut engine = self.learning.lock().await;
        engine.record_feedback(id, positive);
        self.stacks.set_learning_state(engine.state.clone()).await;
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Volume> {
        self.stacks.get(id).await
    }

    pub async fn get_all(&self) -> Vec<Volume> {
        self.stacks.all().await
    }

    pub async fn get_topics(&self) -> HashSet<String> {
        self.stacks.all_topics().await.into_iter().collect()
    }

    pub async fn filter_by_topic(&self, topic: &str) -> Vec<Volume> {
        let ids = self.stacks.topic_entries(topic).await;
        let mut volumes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = self.stacks.get(&id).await {
                volumes.push(v);
            }
        }
        volumes
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedding_provider.embed_one(text).await
    }

    pub async fn check_duplicate(&self, text: &str, embedding: &[f32]) -> crate::dedup::DuplicateCheck {
        let candidates = self.stacks.fingerprints().await;
        self.dedup.check_duplicate(text, embedding, &candidates)
    }

    pub async fn find_duplicates(&self, threshold: f32) -> Vec<Vec<String>> {
        let candidates = self.stacks.fingerprints().await;
        self.dedup.find_duplicate_volumes(&candidates, threshold)
    }

    /// Naive extractive fallback when no Librarian is registered: join the
    /// texts, truncated. Real summarization is delegated to the winning
    /// Librarian for `topic` when the registry is non-empty.
    #[instrument(skip(self, volumes))]
    pub async fn summarize(&self, volumes: &[Volume], topic: &str) -> Result<String> {
        let registry = self.registry.read().await;
        if let Some(librarian) = registry.winner_for(topic) {
            return librarian.summarize(volumes, topic).await;
        }

        let joined = volumes.iter().map(|v| v.text.as_str()).collect::<Vec<_>>().join(" ");
        Ok(joined.chars().take(500).collect())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.stacks.delete(id).await?;
        if deleted {
            info!(id, "memory.delete");
            self.publish(Event::MemoryDelete { id: id.to_string() });
        }
        Ok(deleted)
    }

    pub async fn delete_batch(&self, ids: &[String]) -> Result<usize> {
        let mut count = 0;
        for id in ids {
            if self.delete(id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn clear(&self) -> Result<()> {
        self.stacks.clear().await
    }

    pub fn shelf(self: &Arc<Self>, name: impl Into<String>) -> Shelf {
        Shelf::new(name, self.clone())
    }

    pub async fn shelves(&self) -> HashSet<String> {
        self.stacks
            .all()
            .await
            .into_iter()
            .filter_map(|v| v.shelf().map(str::to_string))
            .collect()
    }

    /// Summarize-and-prune: if `topic` has at least `min_entries` volumes
    /// and the oldest is at least `min_age_ms` old, writes a
    /// `entryType=compendium` volume, optionally deleting the sources.
    #[instrument(skip(self, options))]
    pub async fn compendium(&self, topic: &str, options: CompendiumOptions) -> Result<Option<String>> {
        let volumes = self.filter_by_topic(topic).await;
        if volumes.len() < options.min_entries {
            return Ok(None);
        }

        let oldest = volumes.iter().map(|v| v.timestamp).min().unwrap_or(now_ms());
        if now_ms() - oldest < options.min_age_ms {
            return Ok(None);
        }

        let summary = self.summarize(&volumes, topic).await?;
        let mut metadata = HashMap::new();
        metadata.insert("topic".to_string(), topic.to_string());
        metadata.insert("entryType".to_string(), entry_type::COMPENDIUM.to_string());
        let compendium_id = self.add(summary, metadata).await?;

        if options.delete_originals {
            let ids: Vec<String> = volumes.into_iter().map(|v| v.id).collect();
            self.delete_batch(&ids).await?;
        }

        Ok(Some(compendium_id))
    }

    /// Entries whose `entryType == "compendium"`.
    pub async fn recent_compendia(&self) -> Vec<Volume> {
        self.stacks
            .all()
            .await
            .into_iter()
            .filter(|v| v.entry_type() == Some(entry_type::COMPENDIUM))
            .collect()
    }

    pub async fn patron_profile(&self) -> PatronProfile {
        let engine = self.learning.lock().await;
        PatronProfile {
            adapted_weights: engine.state.adapted_weights,
            interest_embedding: engine.state.interest_embedding.clone(),
            total_queries: engine.state.total_queries,
        }
    }

    pub async fn bm25_search_raw(&self, query: &str) -> Vec<(String, f32)> {
        self.stacks.bm25_search(query, Bm25Params::default()).await
    }

    pub fn stacks(&self) -> &Arc<Stacks> {
        &self.stacks
    }

    /// Reverses initialization order and drains the CirculationDesk if one
    /// was attached by the caller.
    pub async fn dispose(&self) -> Result<()> {
        if let Some(desk) = self.circulation.lock().await.take() {
            desk.drain().await;
            desk.dispose().await;
        }
        if let Some(handle) = self.flush_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.stacks.dispose().await?;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedEmbedding;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0, 0.0]).collect())
        }
    }

    async fn build(dir: &tempfile::TempDir) -> Library {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.embedding.expected_dim = 3;
        Library::initialize(config, Arc::new(FixedEmbedding)).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let library = build(&dir).await;
        let id = library.add("hello".to_string(), HashMap::new()).await.unwrap();
        let volume = library.get_by_id(&id).await.unwrap();
        assert_eq!(volume.text, "hello");
        assert_eq!(library.size().await, 1);
    }

    #[tokio::test]
    async fn dedup_scenario_s1() {
        let dir = tempfile::tempdir().unwrap();
        let library = build(&dir).await;
        let id1 = library.add("Use bun test".to_string(), {
            let mut m = HashMap::new();
            m.insert("topic".to_string(), "testing".to_string());
            m
        }).await.unwrap();

        let embedding = library.embedding_provider.embed_one("Use bun test").await.unwrap();
        let check = library.check_duplicate("Use bun test", &embedding).await;
        assert!(check.is_duplicate);
        assert_eq!(check.existing_id, Some(id1));
        assert_eq!(library.size().await, 1);
    }

    #[tokio::test]
    async fn recent_compendia_filters_by_entry_type() {
        let dir = tempfile::tempdir().unwrap();
        let library = build(&dir).await;
        let mut metadata = HashMap::new();
        metadata.insert("entryType".to_string(), entry_type::COMPENDIUM.to_string());
        library.add("summary".to_string(), metadata).await.unwrap();
        library.add("plain".to_string(), HashMap::new()).await.unwrap();

        let compendia = library.recent_compendia().await;
        assert_eq!(compendia.len(), 1);
        assert_eq!(compendia[0].text, "summary");
    }
}
