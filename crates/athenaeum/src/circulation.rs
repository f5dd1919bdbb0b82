use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use athenaeum_config::CirculationConfig;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{AthenaeumError, Result};
use crate::librarian::Turn;
use crate::library::{CompendiumOptions, Library};
use crate::schema::entry_type;

const QUEUE_CAPACITY: usize = 1024;

/// Librarians bid on this pseudo-topic to claim raw extraction turns that
/// have not yet been classified into a real topic.
const EXTRACTION_TOPIC: &str = "";

#[derive(Debug, Clone)]
pub enum Job {
    Extraction { user_input: String, response: String },
    Compendium { topic: String },
    Reorganization { topic: String },
    Optimization { topic: String },
}

struct Shared {
    queue: StdMutex<VecDeque<Job>>,
    notify: Notify,
    idle: Notify,
    processing: AtomicBool,
    disposed: AtomicBool,
}

fn enqueue_internal(shared: &Shared, job: Job) {
    if shared.disposed.load(Ordering::Acquire) {
        return;
    }
    let mut queue = shared.queue.lock().unwrap();
    if queue.len() < QUEUE_CAPACITY {
        queue.push_back(job);
        drop(queue);
        shared.notify.notify_one();
    }
}

/// Bounded, single-consumer background job queue draining Extraction,
/// Compendium, Reorganization, and Optimization jobs against a `Library`.
/// Single worker task, so same-topic jobs of different kinds run in the
/// order they were enqueued and concurrency per kind never exceeds 1.
pub struct CirculationDesk {
    shared: Arc<Shared>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl CirculationDesk {
    pub fn new(library: Arc<Library>, config: CirculationConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            idle: Notify::new(),
            processing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            run_worker(worker_shared, library, config).await;
        });

        Self {
            shared,
            worker: StdMutex::new(Some(handle)),
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(AthenaeumError::Library("circulation desk is disposed".into()));
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            return Err(AthenaeumError::Library("circulation desk queue is full".into()));
        }
        queue.push_back(job);
        drop(queue);
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn enqueue_extraction(&self, user_input: String, response: String) -> Result<()> {
        self.enqueue(Job::Extraction { user_input, response })
    }

    pub fn enqueue_compendium(&self, topic: String) -> Result<()> {
        self.enqueue(Job::Compendium { topic })
    }

    pub fn enqueue_reorganization(&self, topic: String) -> Result<()> {
        self.enqueue(Job::Reorganization { topic })
    }

    pub fn enqueue_optimization(&self, topic: String) -> Result<()> {
        self.enqueue(Job::Optimization { topic })
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn processing(&self) -> bool {
        self.shared.processing.load(Ordering::Acquire)
    }

    /// Resolves once the queue is empty and no job is in flight.
    pub async fn drain(&self) {
        loop {
            if self.pending() == 0 && !self.processing() {
                return;
            }
            self.shared.idle.notified().await;
        }
    }

    /// Cancels every queued (not yet started) job; an in-flight job still
    /// runs to completion.
    pub fn flush(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    /// Prevents further enqueues, drops whatever is still queued, and waits
    /// for the worker task to exit.
    pub async fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
        self.shared.notify.notify_waiters();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_worker(shared: Arc<Shared>, library: Arc<Library>, config: CirculationConfig) {
    loop {
        let job = shared.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                shared.processing.store(true, Ordering::Release);
                if let Err(err) = execute(&library, &config, &shared, job).await {
                    warn!(error = %err, "circulation job failed");
                }
                shared.processing.store(false, Ordering::Release);
                if shared.queue.lock().unwrap().is_empty() {
                    shared.idle.notify_waiters();
                }
            }
            None => {
                if shared.disposed.load(Ordering::Acquire) {
                    return;
                }
                shared.notify.notified().await;
            }
        }
    }
}

#[instrument(skip(library, config, shared, job))]
async fn execute(library: &Arc<Library>, config: &CirculationConfig, shared: &Shared, job: Job) -> Result<()> {
    match job {
        Job::Extraction { user_input, response } => run_extraction(library, config, shared, user_input, response).await,
        Job::Compendium { topic } => run_compendium(library, config, topic).await,
        Job::Reorganization { topic } => run_reorganization(library, topic).await,
        Job::Optimization { topic } => run_optimization(library, topic).await,
    }
}

async fn run_extraction(
    library: &Arc<Library>,
    config: &CirculationConfig,
    shared: &Shared,
    user_input: String,
    response: String,
) -> Result<()> {
    let winner = {
        let registry = library.registry.read().await;
        registry.winner_for(EXTRACTION_TOPIC)
    };
    let Some(librarian) = winner else {
        return Ok(());
    };

    let turn = Turn { user_input, response };
    let extracted = librarian.extract(&turn).await?;

    let mut touched_topics: HashSet<String> = HashSet::new();
    for memory in extracted {
        let embedding = library.embed(&memory.text).await?;
        if library.check_duplicate(&memory.text, &embedding).await.is_duplicate {
            continue;
        }
        if let Some(topic) = memory.metadata.get("topic").cloned() {
            touched_topics.insert(topic);
        }
        library.add(memory.text, memory.metadata).await?;
    }

    let total = library.size().await;
    for topic in &touched_topics {
        let crosses_global = total >= config.global_escalation_threshold;
        let crosses_topic = !crosses_global && {
            let topic_count = library.filter_by_topic(topic).await.len();
            topic_count >= config.topic_escalation_threshold
        };
        if crosses_global || crosses_topic {
            info!(topic, "circulation auto-escalation: enqueueing optimization");
            enqueue_internal(shared, Job::Optimization { topic: topic.clone() });
        }
    }

    Ok(())
}

async fn run_compendium(library: &Arc<Library>, config: &CirculationConfig, topic: String) -> Result<()> {
    let options = CompendiumOptions {
        min_entries: config.compendium_min_entries,
        min_age_ms: config.compendium_min_age_ms,
        delete_originals: config.compendium_delete_originals,
    };
    library.compendium(&topic, options).await.map(|_| ())
}

async fn run_reorganization(library: &Arc<Library>, topic: String) -> Result<()> {
    let volumes = library.filter_by_topic(&topic).await;
    let winner = {
        let registry = library.registry.read().await;
        registry.winner_for(&topic)
    };
    let Some(librarian) = winner else {
        return Ok(());
    };

    let plan = librarian.reorganize(&topic, &volumes).await?;

    for (volume_id, new_topic) in plan.moves {
        if let Some(volume) = library.get_by_id(&volume_id).await {
            let mut metadata = volume.metadata;
            metadata.insert("topic".to_string(), new_topic);
            library.stacks().update(&volume_id, None, None, Some(metadata)).await?;
        }
    }
    for (from, to) in plan.merges {
        library.stacks().merge_topic(&from, &to).await;
    }
    for subtopic in plan.new_subtopics {
        library.stacks().create_topic(&subtopic).await;
    }

    Ok(())
}

async fn run_optimization(library: &Arc<Library>, topic: String) -> Result<()> {
    let volumes = library.filter_by_topic(&topic).await;
    let winner = {
        let registry = library.registry.read().await;
        registry.winner_for(&topic)
    };
    let Some(librarian) = winner else {
        return Ok(());
    };

    let report = librarian.optimize(&topic, &volumes).await?;
    if !report.pruned.is_empty() {
        library.delete_batch(&report.pruned).await?;
    }
    if let Some(summary) = report.summary {
        let mut metadata = HashMap::new();
        metadata.insert("topic".to_string(), topic);
        metadata.insert("entryType".to_string(), entry_type::COMPENDIUM.to_string());
        library.add(summary, metadata).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::librarian::{ExtractedMemory, Librarian, OptimizationReport, ReorganizationPlan, TopicClassification};
    use crate::providers::EmbeddingProvider;
    use crate::schema::Volume;
    use async_trait::async_trait;
    use athenaeum_config::AppConfig;

    struct FixedEmbedding;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0, 0.0]).collect())
        }
    }

    struct StubLibrarian {
        extracted: Vec<ExtractedMemory>,
    }

    #[async_trait]
    impl Librarian for StubLibrarian {
        fn name(&self) -> &str {
            "stub"
        }

        async fn extract(&self, _turn: &Turn) -> Result<Vec<ExtractedMemory>> {
            Ok(self.extracted.clone())
        }

        async fn summarize(&self, _volumes: &[Volume], _topic: &str) -> Result<String> {
            Ok("summary".to_string())
        }

        async fn classify_topic(&self, _text: &str) -> Result<TopicClassification> {
            Ok(TopicClassification { topic: "misc".into(), confidence: 1.0 })
        }

        async fn reorganize(&self, _topic: &str, _volumes: &[Volume]) -> Result<ReorganizationPlan> {
            Ok(ReorganizationPlan { moves: vec![], merges: vec![], new_subtopics: vec![] })
        }

        async fn optimize(&self, _topic: &str, _volumes: &[Volume]) -> Result<OptimizationReport> {
            Ok(OptimizationReport::default())
        }

        fn bid(&self, _topic: &str) -> f32 {
            1.0
        }
    }

    async fn build_library(dir: &tempfile::TempDir) -> Arc<Library> {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.embedding.expected_dim = 3;
        Arc::new(Library::initialize(config, Arc::new(FixedEmbedding)).await.unwrap())
    }

    #[tokio::test]
    async fn extraction_job_adds_distilled_memories() {
        let dir = tempfile::tempdir().unwrap();
        let library = build_library(&dir).await;
        {
            let mut registry = library.registry.write().await;
            registry.register(Arc::new(StubLibrarian {
                extracted: vec![ExtractedMemory {
                    text: "user prefers dark mode".to_string(),
                    metadata: HashMap::new(),
                }],
            }));
        }

        let desk = CirculationDesk::new(library.clone(), CirculationConfig::default());
        desk.enqueue_extraction("what theme do I like?".to_string(), "dark mode".to_string())
            .unwrap();
        desk.drain().await;

        assert_eq!(library.size().await, 1);
        desk.dispose().await;
    }

    #[tokio::test]
    async fn flush_cancels_queued_jobs_before_they_run() {
        let dir = tempfile::tempdir().unwrap();
        let library = build_library(&dir).await;
        let desk = CirculationDesk::new(library.clone(), CirculationConfig::default());

        desk.enqueue_compendium("topic/a".to_string()).unwrap();
        desk.enqueue_compendium("topic/b".to_string()).unwrap();
        desk.flush();

        assert_eq!(desk.pending(), 0);
        desk.dispose().await;
    }

    #[tokio::test]
    async fn dispose_rejects_further_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let library = build_library(&dir).await;
        let desk = CirculationDesk::new(library.clone(), CirculationConfig::default());
        desk.dispose().await;

        let result = desk.enqueue_compendium("topic".to_string());
        assert!(result.is_err());
    }
}
