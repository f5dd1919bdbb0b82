use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub data_dir: String,
    /// Milliseconds between background flushes; 0 disables the timer.
    pub flush_interval_ms: u64,
    /// Flush immediately after every write instead of waiting for the timer.
    pub auto_save: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            data_dir: ".athenaeum/stacks".to_string(),
            flush_interval_ms: 30_000,
            auto_save: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub expected_dim: usize,
    /// Gzip text whose UTF-8 byte length exceeds this threshold.
    pub gzip_threshold_bytes: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            expected_dim: 384,
            gzip_threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub similarity_threshold: f32,
    pub max_results: usize,
    /// Weight of the vector half of a hybrid search, `0.0..=1.0`.
    pub hybrid_alpha: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.0,
            max_results: 10,
            hybrid_alpha: 0.6,
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    pub default_vector_weight: f32,
    pub default_recency_weight: f32,
    pub default_frequency_weight: f32,
    pub recency_half_life_ms: i64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            default_vector_weight: 0.6,
            default_recency_weight: 0.2,
            default_frequency_weight: 0.2,
            recency_half_life_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Recompute adapted weights every N queries.
    pub adapt_every_n_queries: u32,
    pub query_history_capacity: usize,
    /// Coordinate-search step used when probing each weight +/- delta.
    pub coordinate_step: f32,
    pub negative_feedback_penalty: f32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            adapt_every_n_queries: 32,
            query_history_capacity: 256,
            coordinate_step: 0.05,
            negative_feedback_penalty: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub cosine_threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cosine_threshold: 0.97,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CirculationConfig {
    /// Max concurrently-running jobs per job kind.
    pub concurrency_per_kind: usize,
    pub global_escalation_threshold: usize,
    pub topic_escalation_threshold: usize,
    pub compendium_min_entries: usize,
    pub compendium_min_age_ms: i64,
    pub compendium_delete_originals: bool,
}

impl Default for CirculationConfig {
    fn default() -> Self {
        Self {
            concurrency_per_kind: 1,
            global_escalation_threshold: 5_000,
            topic_escalation_threshold: 500,
            compendium_min_entries: 20,
            compendium_min_age_ms: 7 * 24 * 60 * 60 * 1000,
            compendium_delete_originals: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub recommend: RecommendConfig,
    pub learning: LearningConfig,
    pub dedup: DedupConfig,
    pub circulation: CirculationConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("ATHENAEUM_DATA_DIR") {
            if !value.is_empty() {
                config.storage.data_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
