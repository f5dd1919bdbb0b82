use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Weights {
    pub vector: f32,
    pub recency: f32,
    pub frequency: f32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            recency: 0.2,
            frequency: 0.2,
        }
    }
}

impl Weights {
    pub fn sum(&self) -> f32 {
        self.vector + self.recency + self.frequency
    }
}

/// Sums given/defaulted weights and divides; the zero-sum case falls back
/// to `{0.6, 0.2, 0.2}`. Always returns non-negative weights summing to 1.
pub fn normalize_weights(weights: Weights) -> Weights {
    let vector = weights.vector.max(0.0);
    let recency = weights.recency.max(0.0);
    let frequency = weights.frequency.max(0.0);
    let sum = vector + recency + frequency;

    if sum <= f32::EPSILON {
        return Weights::default();
    }

    Weights {
        vector: vector / sum,
        recency: recency / sum,
        frequency: frequency / sum,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackCounters {
    pub query_count: u64,
    pub total_retrievals: u64,
    pub last_query_timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplicitFeedback {
    pub positive_count: u64,
    pub negative_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHistoryEntry {
    pub embedding: Vec<f32>,
    pub timestamp: i64,
    pub result_count: usize,
    /// Normalized top recommendation score observed for this query, used by
    /// the weight-adaptation surrogate objective.
    pub top_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicProfile {
    pub weights: Weights,
    pub interest_embedding: Option<Vec<f32>>,
    pub query_count: u64,
}

impl Default for TopicProfile {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            interest_embedding: None,
            query_count: 0,
        }
    }
}

/// Persisted under the `__learning` sentinel alongside Volume entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningState {
    pub adapted_weights: Weights,
    pub feedback: HashMap<String, FeedbackCounters>,
    pub query_history: VecDeque<QueryHistoryEntry>,
    pub explicit_feedback: HashMap<String, ExplicitFeedback>,
    pub topic_profiles: HashMap<String, TopicProfile>,
    pub total_queries: u64,
    pub last_updated: i64,
    #[serde(default)]
    pub interest_embedding: Option<Vec<f32>>,
}

impl Default for LearningState {
    fn default() -> Self {
        Self {
            adapted_weights: Weights::default(),
            feedback: HashMap::new(),
            query_history: VecDeque::new(),
            explicit_feedback: HashMap::new(),
            topic_profiles: HashMap::new(),
            total_queries: 0,
            last_updated: 0,
            interest_embedding: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LearningConfig {
    pub adapt_every_n_queries: u32,
    pub query_history_capacity: usize,
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

/// Updates the adapted weight profile from implicit and explicit feedback.
pub struct LearningEngine {
    pub state: LearningState,
    config: LearningConfig,
}

impl LearningEngine {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            state: LearningState::default(),
            config,
        }
    }

    pub fn restore(state: LearningState, config: LearningConfig) -> Self {
        Self { state, config }
    }

    /// Per-result implicit update: bump retrieval counters, record the
    /// query embedding, and maintain an exponentially-decayed interest
    /// embedding (running mean weighted by `1/(1+age)`).
    pub fn record_retrieval(
        &mut self,
        result_ids: &[String],
        query_embedding: &[f32],
        timestamp: i64,
        top_score: f32,
        topic: Option<&str>,
    ) {
        for id in result_ids {
            let counters = self.state.feedback.entry(id.clone()).or_default();
            counters.total_retrievals += 1;
            counters.query_count += 1;
            counters.last_query_timestamp = timestamp;
        }

        self.state.query_history.push_back(QueryHistoryEntry {
            embedding: query_embedding.to_vec(),
            timestamp,
            result_count: result_ids.len(),
            top_score,
        });
        while self.state.query_history.len() > self.config.query_history_capacity {
            self.state.query_history.pop_front();
        }

        self.update_interest_embedding(query_embedding);

        self.state.total_queries += 1;
        self.state.last_updated = timestamp;

        if let Some(topic) = topic {
            let profile = self.state.topic_profiles.entry(topic.to_string()).or_default();
            profile.query_count += 1;
        }

        if self.state.total_queries % self.config.adapt_every_n_queries as u64 == 0 {
            self.adapt_weights(topic);
        }
    }

    fn update_interest_embedding(&mut self, query_embedding: &[f32]) {
        let decay = 1.0 / (1.0 + self.state.total_queries as f32);
        match &mut self.state.interest_embedding {
            Some(existing) if existing.len() == query_embedding.len() => {
                for (e, q) in existing.iter_mut().zip(query_embedding) {
                    *e = *e * (1.0 - decay) + q * decay;
                }
            }
            _ => self.state.interest_embedding = Some(query_embedding.to_vec()),
        }
    }

    pub fn record_feedback(&mut self, id: &str, positive: bool) {
        let counters = self.state.explicit_feedback.entry(id.to_string()).or_default();
        if positive {
            counters.positive_count += 1;
        } else {
            counters.negative_count += 1;
        }
    }

    /// Surrogate objective: mean `top_score` of the last `K` query-history
    /// entries minus a penalty proportional to total negative explicit
    /// feedback counts. Documented choice (§4.9 leaves the exact formula
    /// open); any alternative must preserve the weight-profile invariant.
    fn surrogate_objective(&self, weights: Weights) -> f32 {
        const K: usize = 32;
        let recent: Vec<&QueryHistoryEntry> = self
            .state
            .query_history
            .iter()
            .rev()
            .take(K)
            .collect();

        if recent.is_empty() {
            return 0.0;
        }

        let mean_score = recent.iter().map(|e| e.top_score).sum::<f32>() / recent.len() as f32;
        let weighted = mean_score * (weights.vector + weights.recency * 0.5 + weights.frequency * 0.5);

        let negatives: u64 = self.state.explicit_feedback.values().map(|f| f.negative_count).sum();
        weighted - negatives as f32 * self.config.negative_feedback_penalty
    }

    /// Gradient-free coordinate search: for each weight, try `+delta` and
    /// `-delta`, keep whichever variant (including the unchanged baseline)
    /// maximizes the surrogate objective, then renormalize.
    fn adapt_weights(&mut self, topic: Option<&str>) {
        let current = match topic {
            Some(t) => self.state.topic_profiles.get(t).map(|p| p.weights).unwrap_or_default(),
            None => self.state.adapted_weights,
        };

        let mut best = current;
        let mut best_score = self.surrogate_objective(current);
        let delta = self.config.coordinate_step;

        let candidates = [
            Weights { vector: current.vector + delta, ..current },
            Weights { vector: (current.vector - delta).max(0.0), ..current },
            Weights { recency: current.recency + delta, ..current },
            Weights { recency: (current.recency - delta).max(0.0), ..current },
            Weights { frequency: current.frequency + delta, ..current },
            Weights { frequency: (current.frequency - delta).max(0.0), ..current },
        ];

        for candidate in candidates {
            let normalized = normalize_weights(candidate);
            let score = self.surrogate_objective(normalized);
            if score > best_score {
                best_score = score;
                best = normalized;
            }
        }

        let best = normalize_weights(best);
        match topic {
            Some(t) => self.state.topic_profiles.entry(t.to_string()).or_default().weights = best,
            None => self.state.adapted_weights = best,
        }
    }

    pub fn weights_for(&self, topic: Option<&str>) -> Weights {
        match topic {
            Some(t) => self
                .state
                .topic_profiles
                .get(t)
                .map(|p| p.weights)
                .unwrap_or(self.state.adapted_weights),
            None => self.state.adapted_weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_weights_sums_to_one() {
        let w = normalize_weights(Weights { vector: 3.0, recency: 1.0, frequency: 1.0 });
        assert!((w.sum() - 1.0).abs() < 1e-6);
        assert!(w.vector >= 0.0 && w.recency >= 0.0 && w.frequency >= 0.0);
    }

    #[test]
    fn normalize_weights_zero_sum_falls_back_to_defaults() {
        let w = normalize_weights(Weights { vector: 0.0, recency: 0.0, frequency: 0.0 });
        let default = Weights::default();
        assert!((w.vector - default.vector).abs() < 1e-6);
    }

    #[test]
    fn negative_inputs_are_clamped_before_normalizing() {
        let w = normalize_weights(Weights { vector: -1.0, recency: 1.0, frequency: 1.0 });
        assert!(w.vector >= 0.0);
        assert!((w.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn adaptation_preserves_the_weight_invariant() {
        let mut engine = LearningEngine::new(LearningConfig {
            adapt_every_n_queries: 4,
            ..LearningConfig::default()
        });

        for i in 0..8 {
            engine.record_retrieval(
                &["v1".to_string()],
                &[1.0, 0.0],
                i,
                0.8,
                None,
            );
        }

        let w = engine.state.adapted_weights;
        assert!((w.sum() - 1.0).abs() < 1e-4);
        assert!(w.vector >= 0.0 && w.recency >= 0.0 && w.frequency >= 0.0);
    }

    #[test]
    fn explicit_feedback_increments_counters() {
        let mut engine = LearningEngine::new(LearningConfig::default());
        engine.record_feedback("v1", true);
        engine.record_feedback("v1", false);
        let counters = &engine.state.explicit_feedback["v1"];
        assert_eq!(counters.positive_count, 1);
        assert_eq!(counters.negative_count, 1);
    }
}
