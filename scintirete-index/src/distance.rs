//! Distance kernels.
//!
//! All three metrics are oriented smaller-is-closer so every heap in
//! the engine uses one discipline: L2 stays squared (ordering is
//! preserved and comparisons avoid the sqrt), cosine is `1 - cos`, and
//! inner product is negated.
//!
//! Each kernel folds in index-increasing order, so results are
//! bit-for-bit deterministic for a given input.

use scintirete_core::{Error, MetricKind, Result};

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Squared Euclidean distance: `Σ (aᵢ−bᵢ)²`.
pub fn l2_squared(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        acc += d * d;
    }
    Ok(acc)
}

/// Cosine distance: `1 − (a·b)/(‖a‖·‖b‖)`, non-negative for real
/// inputs up to rounding. A zero-magnitude operand yields distance 1.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }
    Ok(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Negated dot product: `−(a·b)`.
pub fn inner_product(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let mut dot = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
    }
    Ok(-dot)
}

/// Metric dispatch. A plain match: the kernels are small and hot, so
/// this stays a tagged switch rather than a virtual call.
pub fn distance(metric: MetricKind, a: &[f32], b: &[f32]) -> Result<f32> {
    match metric {
        MetricKind::L2 => l2_squared(a, b),
        MetricKind::Cosine => cosine(a, b),
        MetricKind::InnerProduct => inner_product(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_l2_squared_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!(approx_eq(l2_squared(&v, &v).unwrap(), 0.0));
    }

    #[test]
    fn test_l2_squared_345_triangle() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        // Squared distance, so 25 rather than 5.
        assert!(approx_eq(l2_squared(&a, &b).unwrap(), 25.0));
    }

    #[test]
    fn test_cosine_identical_direction() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![2.0, 4.0, 6.0];
        assert!(approx_eq(cosine(&a, &b).unwrap(), 0.0));
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(approx_eq(cosine(&a, &b).unwrap(), 1.0));
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        assert!(approx_eq(cosine(&a, &b).unwrap(), 2.0));
    }

    #[test]
    fn test_cosine_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert!(approx_eq(cosine(&a, &b).unwrap(), 1.0));
    }

    #[test]
    fn test_inner_product_is_negated() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!(approx_eq(inner_product(&a, &b).unwrap(), -32.0));
    }

    #[test]
    fn test_smaller_is_closer_across_metrics() {
        // b is more aligned with q than c; every metric must agree.
        let q = vec![1.0, 0.0];
        let near = vec![0.9, 0.1];
        let far = vec![0.0, 1.0];
        for metric in [MetricKind::L2, MetricKind::Cosine, MetricKind::InnerProduct] {
            let d_near = distance(metric, &q, &near).unwrap();
            let d_far = distance(metric, &q, &far).unwrap();
            assert!(d_near < d_far, "{metric:?}: {d_near} !< {d_far}");
        }
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            l2_squared(&a, &b),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(cosine(&a, &b).is_err());
        assert!(inner_product(&a, &b).is_err());
    }

    #[test]
    fn test_deterministic_summation() {
        let a: Vec<f32> = (0..257).map(|i| (i as f32) * 0.1).collect();
        let b: Vec<f32> = (0..257).map(|i| (i as f32) * -0.05).collect();
        let d1 = l2_squared(&a, &b).unwrap();
        let d2 = l2_squared(&a, &b).unwrap();
        assert_eq!(d1.to_bits(), d2.to_bits());
    }
}
