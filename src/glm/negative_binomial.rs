//! Gamma-Poisson (negative binomial) distribution utilities
//!
//! All functions use the mean / overdispersion parameterization
//! `Var(Y) = mu + alpha * mu^2`. An overdispersion of zero is the Poisson limit.

use statrs::distribution::{DiscreteCDF, NegativeBinomial, Poisson};
use statrs::function::gamma::ln_gamma;

/// Maximum eta value to prevent overflow (exp(700) ≈ 1e304)
pub const MAX_ETA: f64 = 700.0;

/// Calculate the mean given the linear predictor eta and size factor
///
/// mu = size_factor * exp(eta)
pub fn nb_mean(eta: f64, size_factor: f64) -> f64 {
    size_factor * eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log-probability of observing `y` under mean `mu` and overdispersion `alpha`
pub fn nb_log_likelihood(y: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 {
        return if y == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if alpha <= 0.0 {
        return y * mu.ln() - mu - ln_gamma(y + 1.0);
    }

    let r = 1.0 / alpha;
    ln_gamma(y + r) - ln_gamma(r) - ln_gamma(y + 1.0)
        - r * (1.0 + alpha * mu).ln()
        + y * (alpha * mu / (1.0 + alpha * mu)).ln()
}

/// IRLS weight W = mu / (1 + alpha * mu)
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}

/// Cumulative probability P(Y <= y)
///
/// Non-integer `y` is rounded to the nearest count. A zero mean puts all
/// mass at zero.
pub fn nb_cdf(y: f64, mu: f64, alpha: f64) -> f64 {
    let y = y.round();
    if y < 0.0 {
        return 0.0;
    }
    if mu <= 0.0 {
        return 1.0;
    }
    let k = y as u64;
    if alpha <= 0.0 {
        return match Poisson::new(mu) {
            Ok(dist) => dist.cdf(k),
            Err(_) => f64::NAN,
        };
    }
    match NegativeBinomial::new(1.0 / alpha, 1.0 / (1.0 + alpha * mu)) {
        Ok(dist) => dist.cdf(k),
        Err(_) => f64::NAN,
    }
}

/// Unit deviance 2 * (l(y; y) - l(y; mu)) of one observation
pub fn nb_unit_deviance(y: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 {
        return if y == 0.0 { 0.0 } else { f64::INFINITY };
    }
    let y_log_ratio = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
    if alpha <= 0.0 {
        return 2.0 * (y_log_ratio - (y - mu));
    }
    let r = 1.0 / alpha;
    let dev = 2.0 * (y_log_ratio - (y + r) * ((1.0 + alpha * y) / (1.0 + alpha * mu)).ln());
    dev.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nb_mean() {
        let mu = nb_mean(2.0, 1.0);
        assert!((mu - 2.0_f64.exp()).abs() < 1e-10);
        assert!(nb_mean(1e6, 1.0).is_finite());
    }

    #[test]
    fn test_nb_variance() {
        assert!((nb_variance(10.0, 0.1) - 20.0).abs() < 1e-10);
        assert_eq!(nb_variance(10.0, 0.0), 10.0);
    }

    #[test]
    fn test_log_likelihood_poisson_limit() {
        let poisson = nb_log_likelihood(5.0, 5.0, 0.0);
        let nearly = nb_log_likelihood(5.0, 5.0, 1e-7);
        assert!((poisson - nearly).abs() < 1e-4);
        assert!(poisson < 0.0);
    }

    #[test]
    fn test_log_likelihood_zero_mean() {
        assert_eq!(nb_log_likelihood(0.0, 0.0, 0.1), 0.0);
        assert_eq!(nb_log_likelihood(2.0, 0.0, 0.1), f64::NEG_INFINITY);
    }

    #[test]
    fn test_nb_weight() {
        assert!((nb_weight(10.0, 0.1) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_cdf_matches_probabilities() {
        // P(Y = 0) for NB(mu = 2, alpha = 0.5) is (1 + alpha * mu)^(-1 / alpha) = 2^-2
        assert!((nb_cdf(0.0, 2.0, 0.5) - 0.25).abs() < 1e-10);
        // Poisson P(Y <= 0) = exp(-mu)
        assert!((nb_cdf(0.0, 3.0, 0.0) - (-3.0_f64).exp()).abs() < 1e-12);
        assert_eq!(nb_cdf(-1.0, 3.0, 0.1), 0.0);
        assert_eq!(nb_cdf(4.0, 0.0, 0.1), 1.0);
        assert!(nb_cdf(500.0, 3.0, 0.1) > 0.999999);
    }

    #[test]
    fn test_unit_deviance() {
        assert!(nb_unit_deviance(4.0, 4.0, 0.2).abs() < 1e-12);
        assert!((nb_unit_deviance(0.0, 2.0, 0.0) - 4.0).abs() < 1e-12);
        assert!(nb_unit_deviance(10.0, 2.0, 0.2) > 0.0);
        assert_eq!(nb_unit_deviance(0.0, 0.0, 0.2), 0.0);
    }
}
