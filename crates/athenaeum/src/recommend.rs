use crate::learning::Weights;

pub const DEFAULT_HALF_LIFE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// `exp(-ln(2) * ageMs / halfLifeMs)`.
pub fn recency_score(age_ms: i64, half_life_ms: i64) -> f32 {
    if half_life_ms <= 0 {
        return if age_ms <= 0 { 1.0 } else { 0.0 };
    }
    let age_ms = age_ms.max(0) as f32;
    (-std::f32::consts::LN_2 * age_ms / half_life_ms as f32).exp()
}

/// `ln(1 + accessCount) / ln(1 + maxAccessCount)`; `0` if `max_access_count`
/// is `0` (no accesses across the candidate set).
pub fn frequency_score(access_count: u64, max_access_count: u64) -> f32 {
    if max_access_count == 0 {
        return 0.0;
    }
    ((1.0 + access_count as f32).ln()) / ((1.0 + max_access_count as f32).ln())
}

#[derive(Debug, Clone, Copy)]
pub struct RecommendCandidate {
    pub vector_score: Option<f32>,
    pub age_ms: i64,
    pub access_count: u64,
}

/// Weighted combination of vector similarity, recency, and frequency for a
/// single candidate. `max_access_count` must be computed across the whole
/// candidate set before calling this per-candidate.
pub fn recommend_score(
    candidate: RecommendCandidate,
    weights: Weights,
    half_life_ms: i64,
    max_access_count: u64,
) -> f32 {
    let vector = candidate.vector_score.unwrap_or(0.0);
    let recency = recency_score(candidate.age_ms, half_life_ms);
    let frequency = frequency_score(candidate.access_count, max_access_count);

    weights.vector * vector + weights.recency * recency + weights.frequency * frequency
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_decay_scenario_s4() {
        let half_life = 1000;
        let old = recency_score(1000, half_life);
        let fresh = recency_score(0, half_life);

        assert!((old - 0.5).abs() < 0.01);
        assert!((fresh - 1.0).abs() < 1e-6);
    }

    #[test]
    fn frequency_score_is_zero_with_no_accesses() {
        assert_eq!(frequency_score(0, 0), 0.0);
    }

    #[test]
    fn frequency_score_is_one_at_the_maximum() {
        assert!((frequency_score(10, 10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn combined_score_uses_provided_weights() {
        let weights = Weights { vector: 1.0, recency: 0.0, frequency: 0.0 };
        let score = recommend_score(
            RecommendCandidate { vector_score: Some(0.5), age_ms: 0, access_count: 0 },
            weights,
            DEFAULT_HALF_LIFE_MS,
            0,
        );
        assert!((score - 0.5).abs() < 1e-6);
    }
}
