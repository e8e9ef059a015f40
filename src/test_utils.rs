//! Finite-difference helpers shared by the unit tests.
//!
//! Backward passes are checked against central differences of a random
//! linear functional `L(y) = <w, y>` of the forward output: the analytic
//! gradient for upstream `w` must match `dL/dx` numerically.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) const FD_STEP: f64 = 1e-6;
pub(crate) const FD_TOLERANCE: f64 = 1e-6;

pub(crate) fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `n` weights drawn uniformly from [-1, 1).
pub(crate) fn random_weights(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = seeded_rng(seed);
    (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Central-difference gradient of a scalar function.
pub(crate) fn numeric_gradient(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
    let mut shifted = x.to_vec();
    (0..x.len())
        .map(|i| {
            shifted[i] = x[i] + FD_STEP;
            let plus = f(&shifted);
            shifted[i] = x[i] - FD_STEP;
            let minus = f(&shifted);
            shifted[i] = x[i];
            (plus - minus) / (2.0 * FD_STEP)
        })
        .collect()
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Element-wise comparison with a mixed absolute/relative tolerance.
pub(crate) fn assert_slices_close(analytic: &[f64], numeric: &[f64], tolerance: f64, what: &str) {
    assert_eq!(analytic.len(), numeric.len(), "{what}: length mismatch");
    for (i, (a, n)) in analytic.iter().zip(numeric).enumerate() {
        let scale = 1.0_f64.max(a.abs()).max(n.abs());
        assert!(
            (a - n).abs() <= tolerance * scale,
            "{what}[{i}]: analytic {a} vs numeric {n}"
        );
    }
}
