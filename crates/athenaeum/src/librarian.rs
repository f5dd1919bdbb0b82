use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::providers::{GenerateOptions, TextGenerationProvider};
use crate::schema::Volume;

#[derive(Debug, Clone)]
pub struct ExtractedMemory {
    pub text: String,
    pub metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub user_input: String,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct TopicClassification {
    pub topic: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct ReorganizationPlan {
    pub moves: Vec<(String, String)>,
    pub merges: Vec<(String, String)>,
    pub new_subtopics: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OptimizationReport {
    pub pruned: Vec<String>,
    pub summary: Option<String>,
}

/// An LLM-driven collaborator: extract / summarize / classify / reorganize
/// / optimize. The core never calls a model directly; it calls this trait.
#[async_trait]
pub trait Librarian: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, turn: &Turn) -> Result<Vec<ExtractedMemory>>;
    async fn summarize(&self, volumes: &[Volume], topic: &str) -> Result<String>;
    async fn classify_topic(&self, text: &str) -> Result<TopicClassification>;
    async fn reorganize(&self, topic: &str, volumes: &[Volume]) -> Result<ReorganizationPlan>;
    async fn optimize(&self, topic: &str, volumes: &[Volume]) -> Result<OptimizationReport>;

    /// How strongly this Librarian wants to handle `topic`; the registry
    /// hands the topic to whichever Librarian bids highest.
    fn bid(&self, topic: &str) -> f32;
}

/// Returned to callers so they can release a Librarian reference; dropping
/// it is a no-op today but gives the registry a seam for reference
/// counting if collaborators ever need explicit teardown.
pub struct DisposableConnection {
    name: String,
}

impl DisposableConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Holds multiple Librarians and arbitrates among them per topic.
pub struct LibrarianRegistry {
    librarians: Vec<std::sync::Arc<dyn Librarian>>,
}

impl Default for LibrarianRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LibrarianRegistry {
    pub fn new() -> Self {
        Self { librarians: Vec::new() }
    }

    pub fn register(&mut self, librarian: std::sync::Arc<dyn Librarian>) -> DisposableConnection {
        let name = librarian.name().to_string();
        self.librarians.push(librarian);
        DisposableConnection::new(name)
    }

    /// Highest bid wins; ties broken by registration order (first
    /// registered wins among equal bids).
    pub fn winner_for(&self, topic: &str) -> Option<std::sync::Arc<dyn Librarian>> {
        self.librarians
            .iter()
            .map(|l| (l.bid(topic), l))
            .fold(None, |best, (score, l)| match best {
                Some((best_score, _)) if best_score >= score => best,
                _ => Some((score, l)),
            })
            .map(|(_, l)| l.clone())
    }

    pub fn len(&self) -> usize {
        self.librarians.len()
    }

    pub fn is_empty(&self) -> bool {
        self.librarians.is_empty()
    }
}

fn strip_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn is_none(value: &str) -> bool {
    value.eq_ignore_ascii_case("none") || value.is_empty()
}

/// Prompts an injected [`TextGenerationProvider`] to perform the work every
/// `Librarian` method asks for, using the same labeled-line prompt/response
/// shape as the rest of the crate's LLM-facing collaborators: ask for one
/// directive per line under an explicit key, tolerate `NONE`, ignore
/// anything that doesn't parse.
pub struct DefaultLibrarian {
    provider: Arc<dyn TextGenerationProvider>,
    options: GenerateOptions,
}

impl DefaultLibrarian {
    pub fn new(provider: Arc<dyn TextGenerationProvider>) -> Self {
        Self { provider, options: GenerateOptions::default() }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let result = self.provider.generate(prompt, &self.options).await?;
        Ok(result.content)
    }
}

/// Wires a `TextGenerationProvider` behind the `Librarian` trait for
/// callers that don't need a specialized implementation.
pub fn create_default_librarian(provider: Arc<dyn TextGenerationProvider>) -> Arc<dyn Librarian> {
    Arc::new(DefaultLibrarian::new(provider))
}

#[async_trait]
impl Librarian for DefaultLibrarian {
    fn name(&self) -> &str {
        "default"
    }

    async fn extract(&self, turn: &Turn) -> Result<Vec<ExtractedMemory>> {
        let prompt = format!(
            "Review the conversation turn below and extract any facts worth \
remembering long-term. Respond with one memory per pair of lines:\n\
MEMORY: <text to remember>\n\
TOPIC: <topic for the preceding MEMORY, or NONE>\n\
Use NONE for both if nothing is worth remembering.\n\n\
USER: {}\n\
ASSISTANT: {}",
            turn.user_input, turn.response
        );

        let reply = self.generate(&prompt).await?;
        let mut memories = Vec::new();
        for line in reply.lines() {
            let line = line.trim();
            if let Some(rest) = strip_key(line, "MEMORY:") {
                if !is_none(rest) {
                    memories.push(ExtractedMemory {
                        text: rest.to_string(),
                        metadata: std::collections::HashMap::new(),
                    });
                }
            } else if let Some(rest) = strip_key(line, "TOPIC:") {
                if !is_none(rest) {
                    if let Some(last) = memories.last_mut() {
                        last.metadata.insert("topic".to_string(), rest.to_string());
                    }
                }
            }
        }
        Ok(memories)
    }

    async fn summarize(&self, volumes: &[Volume], topic: &str) -> Result<String> {
        let notes = volumes.iter().map(|v| v.text.as_str()).collect::<Vec<_>>().join("\n- ");
        let prompt = format!(
            "Summarize the following notes filed under topic \"{topic}\" into a \
single concise compendium entry. Respond with only the summary text.\n\n- {notes}"
        );
        Ok(self.generate(&prompt).await?.trim().to_string())
    }

    async fn classify_topic(&self, text: &str) -> Result<TopicClassification> {
        let prompt = format!(
            "Classify the text below with a single topic path (e.g. \
\"programming/rust\") and a confidence between 0 and 1. Respond in exactly \
this format:\nTOPIC: <topic>\nCONFIDENCE: <0.0-1.0>\n\nTEXT:\n{text}"
        );

        let reply = self.generate(&prompt).await?;
        let mut topic = "misc".to_string();
        let mut confidence = 0.0_f32;
        for line in reply.lines() {
            let line = line.trim();
            if let Some(rest) = strip_key(line, "TOPIC:") {
                if !is_none(rest) {
                    topic = rest.to_string();
                }
            } else if let Some(rest) = strip_key(line, "CONFIDENCE:") {
                if let Ok(value) = rest.parse::<f32>() {
                    confidence = value.clamp(0.0, 1.0);
                }
            }
        }
        Ok(TopicClassification { topic, confidence })
    }

    async fn reorganize(&self, topic: &str, volumes: &[Volume]) -> Result<ReorganizationPlan> {
        let listed = volumes
            .iter()
            .map(|v| format!("  [{}] {}", v.id, v.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Review the notes filed under topic \"{topic}\" below and propose a \
reorganization. Respond with one directive per line:\n\
MOVE: <id> -> <new_topic>\n\
MERGE: <topic_a> -> <topic_b>\n\
SUBTOPIC: <new_subtopic>\n\
Use NONE if no changes are warranted.\n\n{listed}"
        );

        let reply = self.generate(&prompt).await?;
        let mut plan = ReorganizationPlan { moves: Vec::new(), merges: Vec::new(), new_subtopics: Vec::new() };
        for line in reply.lines() {
            let line = line.trim();
            if let Some(rest) = strip_key(line, "MOVE:") {
                if !is_none(rest) {
                    if let Some((id, new_topic)) = rest.split_once("->") {
                        plan.moves.push((id.trim().to_string(), new_topic.trim().to_string()));
                    }
                }
            } else if let Some(rest) = strip_key(line, "MERGE:") {
                if !is_none(rest) {
                    if let Some((from, to)) = rest.split_once("->") {
                        plan.merges.push((from.trim().to_string(), to.trim().to_string()));
                    }
                }
            } else if let Some(rest) = strip_key(line, "SUBTOPIC:") {
                if !is_none(rest) {
                    plan.new_subtopics.push(rest.to_string());
                }
            }
        }
        Ok(plan)
    }

    async fn optimize(&self, topic: &str, volumes: &[Volume]) -> Result<OptimizationReport> {
        let listed = volumes
            .iter()
            .map(|v| format!("  [{}] {}", v.id, v.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Review the notes filed under topic \"{topic}\" below for redundancy. \
Respond with:\n\
PRUNE: <id> (one line per id to delete, or NONE)\n\
SUMMARY: <consolidated summary text, or NONE>\n\n{listed}"
        );

        let reply = self.generate(&prompt).await?;
        let mut report = OptimizationReport::default();
        for line in reply.lines() {
            let line = line.trim();
            if let Some(rest) = strip_key(line, "PRUNE:") {
                if !is_none(rest) {
                    report.pruned.push(rest.split_whitespace().next().unwrap_or(rest).to_string());
                }
            } else if let Some(rest) = strip_key(line, "SUMMARY:") {
                if !is_none(rest) {
                    report.summary = Some(rest.to_string());
                }
            }
        }
        Ok(report)
    }

    fn bid(&self, _topic: &str) -> f32 {
        0.4
    }
}
