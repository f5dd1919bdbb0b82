/// Exact cosine similarity. Mismatched dimensions return `0.0` rather than
/// erroring; NaN components are treated as contributing `0.0` to the dot
/// product and norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity_with_norms(a, b, None, None)
}

/// Cosine similarity that accepts precomputed norms (from the
/// `MagnitudeCache`) to avoid recomputing `‖v‖` on every comparison.
pub fn cosine_similarity_with_norms(
    a: &[f32],
    b: &[f32],
    norm_a: Option<f32>,
    norm_b: Option<f32>,
) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let x = if x.is_nan() { 0.0 } else { *x };
            let y = if y.is_nan() { 0.0 } else { *y };
            x * y
        })
        .sum();

    let norm_a = norm_a.unwrap_or_else(|| magnitude(a));
    let norm_b = norm_b.unwrap_or_else(|| magnitude(b));

    if norm_a == 0.0 || norm_b == 0.0 || !norm_a.is_finite() || !norm_b.is_finite() {
        return 0.0;
    }

    let score = dot / (norm_a * norm_b);
    if score.is_nan() {
        0.0
    } else {
        score.clamp(-1.0, 1.0)
    }
}

/// `‖v‖ = sqrt(sum(v_i^2))`, treating NaN components as `0.0`.
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter()
        .map(|x| if x.is_nan() { 0.0 } else { x * x })
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_return_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn zero_vector_returns_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn nan_components_do_not_propagate() {
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), cosine_similarity(&[0.0, 1.0], &[1.0, 1.0]));
    }
}
