use async_trait::async_trait;

use crate::error::{AthenaeumError, Result};

/// Injected collaborator that turns text into vectors. The core never
/// executes an embedding model itself.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| AthenaeumError::Embedding("provider returned no vectors".into()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub content: String,
}

/// Injected collaborator for summarization/extraction prompts; optional
/// and only required by Librarians backed by a real model.
#[async_trait]
pub trait TextGenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResult>;
}

/// Published on `memory.add`, `memory.search`, `memory.delete`. `Library`
/// always also emits a `tracing::info!` for the same events, so the event
/// stream exists even with no sink attached.
#[derive(Debug, Clone)]
pub enum Event {
    MemoryAdd { id: String },
    MemorySearch { query: String, result_count: usize },
    MemoryDelete { id: String },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl EmbeddingProvider for EchoProvider {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[tokio::test]
    async fn embed_one_delegates_to_embed() {
        let provider = EchoProvider;
        let vector = provider.embed_one("abc").await.unwrap();
        assert_eq!(vector, vec![3.0]);
    }

    struct EmptyProvider;

    #[async_trait]
    impl EmbeddingProvider for EmptyProvider {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn embed_one_errors_when_provider_returns_nothing() {
        let provider = EmptyProvider;
        assert!(provider.embed_one("abc").await.is_err());
    }
}
