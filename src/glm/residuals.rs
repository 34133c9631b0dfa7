//! Residuals of a fitted Gamma-Poisson model

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use super::negative_binomial::{nb_cdf, nb_unit_deviance, nb_variance};
use crate::error::{Result, TransformError};
use crate::rng::UniformSource;
use crate::stats::qnorm;

/// Kinds of residuals that can be extracted from a fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualKind {
    /// Dunn-Smyth residuals, Φ⁻¹(u) with u uniform on [F(y-1), F(y)]
    RandomizedQuantile,
    /// (y - mu) / sqrt(mu + alpha * mu^2)
    Pearson,
    Deviance,
    /// (y - mu) / mu
    Working,
    /// y - mu
    Response,
    /// Φ⁻¹ of the midpoint of [F(y-1), F(y)]
    Quantile,
}

impl ResidualKind {
    pub fn needs_randomness(&self) -> bool {
        matches!(self, ResidualKind::RandomizedQuantile)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResidualKind::RandomizedQuantile => "randomized_quantile",
            ResidualKind::Pearson => "pearson",
            ResidualKind::Deviance => "deviance",
            ResidualKind::Working => "working",
            ResidualKind::Response => "response",
            ResidualKind::Quantile => "quantile",
        }
    }
}

impl fmt::Display for ResidualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResidualKind {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "randomized_quantile" | "randomized_quantile_residuals" => Ok(ResidualKind::RandomizedQuantile),
            "pearson" | "pearson_residuals" => Ok(ResidualKind::Pearson),
            "deviance" => Ok(ResidualKind::Deviance),
            "working" => Ok(ResidualKind::Working),
            "response" => Ok(ResidualKind::Response),
            "quantile" => Ok(ResidualKind::Quantile),
            _ => Err(TransformError::UnsupportedResidualKind { kind: s.to_string() }),
        }
    }
}

/// Pearson residual; zero when both count and mean are zero
pub fn pearson_residual(y: f64, mu: f64, alpha: f64) -> f64 {
    if y == 0.0 && mu == 0.0 {
        return 0.0;
    }
    (y - mu) / nb_variance(mu, alpha).sqrt()
}

pub fn deviance_residual(y: f64, mu: f64, alpha: f64) -> f64 {
    let dev = nb_unit_deviance(y, mu, alpha).sqrt();
    if y >= mu {
        dev
    } else {
        -dev
    }
}

/// Working residual; zero when both count and mean are zero
pub fn working_residual(y: f64, mu: f64) -> f64 {
    if y == 0.0 && mu == 0.0 {
        return 0.0;
    }
    (y - mu) / mu
}

/// Probability interval [F(y - 1), F(y)] of an observed count
fn cdf_interval(y: f64, mu: f64, alpha: f64) -> (f64, f64) {
    let y = y.round();
    (nb_cdf(y - 1.0, mu, alpha), nb_cdf(y, mu, alpha))
}

fn clamp_probability(p: f64) -> f64 {
    p.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON / 2.0)
}

/// Randomized quantile residual for a uniform draw `u`
pub fn randomized_quantile_residual(y: f64, mu: f64, alpha: f64, u: f64) -> f64 {
    let (lo, hi) = cdf_interval(y, mu, alpha);
    qnorm(clamp_probability(lo + u * (hi - lo)))
}

pub fn quantile_residual(y: f64, mu: f64, alpha: f64) -> f64 {
    let (lo, hi) = cdf_interval(y, mu, alpha);
    qnorm(clamp_probability((lo + hi) / 2.0))
}

/// Residuals for one block of genes
///
/// `alphas` holds one overdispersion per row. Randomized residuals draw one
/// uniform per entry in row-major order from `stream`.
pub fn residuals_block(
    kind: ResidualKind,
    counts: ArrayView2<'_, f64>,
    mu: ArrayView2<'_, f64>,
    alphas: ArrayView1<'_, f64>,
    stream: Option<&mut dyn UniformSource>,
) -> Result<Array2<f64>> {
    if counts.dim() != mu.dim() || alphas.len() != counts.nrows() {
        return Err(TransformError::DimensionMismatch {
            expected: format!("means and overdispersions for a {:?} block", counts.dim()),
            got: format!("means {:?}, {} overdispersions", mu.dim(), alphas.len()),
        });
    }

    let mut out = Array2::zeros(counts.dim());
    match kind {
        ResidualKind::RandomizedQuantile => {
            let stream = stream.ok_or_else(|| TransformError::InvalidInput {
                reason: "randomized quantile residuals need a random stream".to_string(),
            })?;
            for ((gene, sample), value) in out.indexed_iter_mut() {
                let u = stream.next_uniform();
                *value = randomized_quantile_residual(counts[[gene, sample]], mu[[gene, sample]], alphas[gene], u);
            }
        }
        _ => {
            for (gene, mut row) in out.rows_mut().into_iter().enumerate() {
                let alpha = alphas[gene];
                Zip::from(&mut row)
                    .and(counts.row(gene))
                    .and(mu.row(gene))
                    .for_each(|r, &y, &m| {
                        *r = match kind {
                            ResidualKind::Pearson => pearson_residual(y, m, alpha),
                            ResidualKind::Deviance => deviance_residual(y, m, alpha),
                            ResidualKind::Working => working_residual(y, m),
                            ResidualKind::Response => y - m,
                            ResidualKind::Quantile => quantile_residual(y, m, alpha),
                            ResidualKind::RandomizedQuantile => f64::NAN,
                        }
                    });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_kinds() {
        assert_eq!("pearson".parse::<ResidualKind>().unwrap(), ResidualKind::Pearson);
        assert_eq!(
            "randomized_quantile".parse::<ResidualKind>().unwrap(),
            ResidualKind::RandomizedQuantile
        );
        assert!(matches!(
            "studentized".parse::<ResidualKind>(),
            Err(TransformError::UnsupportedResidualKind { .. })
        ));
    }

    #[test]
    fn test_pearson_hand_values() {
        let counts = array![[0.0, 5.0, 10.0]];
        let mu = array![[2.0, 2.0, 2.0]];
        let out = residuals_block(ResidualKind::Pearson, counts.view(), mu.view(), array![0.1].view(), None).unwrap();
        let sd = 2.4_f64.sqrt();
        for (r, y) in out.iter().zip([0.0, 5.0, 10.0]) {
            assert!((r - (y - 2.0) / sd).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_mean_zero_count() {
        assert_eq!(pearson_residual(0.0, 0.0, 0.5), 0.0);
        assert_eq!(working_residual(0.0, 0.0), 0.0);
        assert_eq!(deviance_residual(0.0, 0.0, 0.5), 0.0);
    }

    #[test]
    fn test_deviance_sign() {
        assert!(deviance_residual(10.0, 2.0, 0.1) > 0.0);
        assert!(deviance_residual(0.0, 2.0, 0.1) < 0.0);
    }

    #[test]
    fn test_randomized_quantile_bounds() {
        // With u in (0, 1), the residual lies between the quantiles of the interval ends
        let (lo, hi) = cdf_interval(3.0, 4.0, 0.2);
        let low = randomized_quantile_residual(3.0, 4.0, 0.2, 1e-9);
        let high = randomized_quantile_residual(3.0, 4.0, 0.2, 1.0 - 1e-9);
        assert!((low - qnorm(lo)).abs() < 1e-6);
        assert!((high - qnorm(hi)).abs() < 1e-6);
        let mid = quantile_residual(3.0, 4.0, 0.2);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_zero_mean_randomized_residual_is_finite() {
        // All mass at zero: the interval for y = 0 is [0, 1]
        let r = randomized_quantile_residual(0.0, 0.0, 0.1, 0.5);
        assert!(r.abs() < 1e-12);
    }

    #[test]
    fn test_randomized_requires_stream() {
        let counts = array![[1.0]];
        let result = residuals_block(
            ResidualKind::RandomizedQuantile,
            counts.view(),
            counts.view(),
            array![0.1].view(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_injected_stream_order() {
        let counts = array![[1.0, 2.0], [3.0, 4.0]];
        let mu = array![[2.0, 2.0], [3.0, 3.0]];
        let mut draws = vec![0.1, 0.2, 0.3, 0.4].into_iter();
        let mut source = move || draws.next().unwrap_or(0.5);
        let out = residuals_block(
            ResidualKind::RandomizedQuantile,
            counts.view(),
            mu.view(),
            array![0.1, 0.1].view(),
            Some(&mut source),
        )
        .unwrap();
        assert!((out[[1, 0]] - randomized_quantile_residual(3.0, 3.0, 0.1, 0.3)).abs() < 1e-15);
        assert!((out[[0, 1]] - randomized_quantile_residual(2.0, 2.0, 0.1, 0.2)).abs() < 1e-15);
    }
}
