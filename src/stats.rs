//! Statistical helper functions shared across modules

use std::f64::consts::SQRT_2;

use statrs::function::erf::erfc_inv;

/// Inverse normal CDF (quantile function)
///
/// Φ⁻¹(p) = -√2 · erfc⁻¹(2p), evaluated through statrs so tail
/// probabilities keep full precision.
pub fn qnorm(p: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    -SQRT_2 * erfc_inv(2.0 * p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qnorm_known_values() {
        // R: qnorm(c(0.975, 0.999, 1e-10), digits = 16)
        assert!((qnorm(0.975) - 1.959963984540054).abs() < 1e-13);
        assert!(qnorm(0.5).abs() < 1e-15);
        assert!((qnorm(0.999) - 3.090232306167813).abs() < 1e-12);
        assert!((qnorm(0.001) + 3.090232306167813).abs() < 1e-12);
        assert!((qnorm(1e-10) + 6.361340902404056).abs() < 1e-9);
    }

    #[test]
    fn test_qnorm_symmetry_and_limits() {
        for &p in &[0.01, 0.2, 0.3, 0.45] {
            assert!((qnorm(p) + qnorm(1.0 - p)).abs() < 1e-12, "asymmetry at p={}", p);
        }
        assert_eq!(qnorm(0.0), f64::NEG_INFINITY);
        assert_eq!(qnorm(1.0), f64::INFINITY);
        assert!(qnorm(f64::NAN).is_nan());
    }
}
