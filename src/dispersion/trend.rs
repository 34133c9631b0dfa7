//! Mean-dependent trend of the overdispersions

use ndarray::{Array1, ArrayView1};

use crate::error::{Result, TransformError};

/// Overdispersions at or below this are not used to fit the trend
const MIN_TREND_OVERDISPERSION: f64 = 1e-6;

/// Fit a trend to per-gene overdispersions as a function of normalized mean
///
/// Tries the parametric form `a0 + a1 / mean`. When that fails (too few
/// informative genes, non-positive coefficients or no convergence) every gene
/// gets the trimmed mean of the informative overdispersions instead.
pub fn fit_overdispersion_trend(means: ArrayView1<'_, f64>, overdispersions: ArrayView1<'_, f64>) -> Array1<f64> {
    match fit_parametric_trend(means, overdispersions) {
        Ok((trend, (a0, a1))) => {
            log::info!("Overdispersion trend: {:.4} + {:.4} / mean", a0, a1);
            trend
        }
        Err(e) => {
            log::info!("Parametric trend failed ({}), using mean overdispersion", e);
            let mean = trimmed_mean_overdispersion(overdispersions);
            Array1::from_elem(overdispersions.len(), mean)
        }
    }
}

fn fit_parametric_trend(
    means: ArrayView1<'_, f64>,
    overdispersions: ArrayView1<'_, f64>,
) -> Result<(Array1<f64>, (f64, f64))> {
    let valid: Vec<(f64, f64)> = means
        .iter()
        .zip(overdispersions.iter())
        .filter(|(&m, &d)| m > 0.0 && d > MIN_TREND_OVERDISPERSION && d.is_finite())
        .map(|(&m, &d)| (m, d))
        .collect();

    if valid.len() < 3 {
        return Err(TransformError::ModelFit {
            reason: "not enough informative genes for a trend".to_string(),
        });
    }

    let (a0, a1) = fit_parametric_coefficients(&valid)?;
    let trend = means.mapv(|m| if m > 0.0 { a0 + a1 / m } else { a0 });
    Ok((trend, (a0, a1)))
}

/// Iterated Gamma GLM on `d ~ a0 + a1 / mean`, dropping points whose ratio
/// to the current fit is outside (1e-4, 15)
fn fit_parametric_coefficients(data: &[(f64, f64)]) -> Result<(f64, f64)> {
    let mut coefs = (0.1_f64, 1.0_f64);

    for iter in 0..11 {
        let old = coefs;

        let good: Vec<(f64, f64)> = data
            .iter()
            .filter(|&&(mean, d)| {
                let fitted = coefs.0 + coefs.1 / mean;
                fitted > 0.0 && {
                    let ratio = d / fitted;
                    ratio > 1e-4 && ratio < 15.0
                }
            })
            .copied()
            .collect();

        if good.len() < 3 {
            return Err(TransformError::ModelFit {
                reason: "not enough genes close to the trend".to_string(),
            });
        }

        let (next, converged) = fit_gamma_identity(&good, coefs);
        coefs = next;
        log::debug!(
            "Trend iteration {}: {} genes, a0={:.6}, a1={:.6}",
            iter + 1,
            good.len(),
            coefs.0,
            coefs.1
        );

        if coefs.0 <= 0.0 || coefs.1 <= 0.0 {
            return Err(TransformError::ModelFit {
                reason: format!("trend coefficients not positive (a0={:.4}, a1={:.4})", coefs.0, coefs.1),
            });
        }

        let change = (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if change < 1e-6 && converged {
            return Ok(coefs);
        }
    }

    Err(TransformError::ModelFit {
        reason: "overdispersion trend did not converge".to_string(),
    })
}

fn gamma_deviance(data: &[(f64, f64)], a0: f64, a1: f64) -> f64 {
    data.iter()
        .map(|&(mean, d)| {
            let mu = (a0 + a1 / mean).max(1e-8);
            2.0 * (-(d / mu).ln() + (d - mu) / mu)
        })
        .sum()
}

/// Gamma GLM with identity link, returns ((a0, a1), converged)
fn fit_gamma_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let (mut a0, mut a1) = start;
    let mut dev_old = gamma_deviance(data, a0, a1);

    for _ in 0..25 {
        let (mut sw, mut swx, mut swz, mut swxx, mut swxz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(mean, d) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sw += w;
            swx += w * x;
            swz += w * d;
            swxx += w * x * x;
            swxz += w * x * d;
        }

        let det = sw * swxx - swx * swx;
        if det.abs() < 1e-10 {
            break;
        }
        a0 = (swxx * swz - swx * swxz) / det;
        a1 = (sw * swxz - swx * swz) / det;

        let dev = gamma_deviance(data, a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < 1e-8 {
            return ((a0, a1), true);
        }
        dev_old = dev;
    }

    ((a0, a1), false)
}

/// Mean of the informative overdispersions with 0.1% trimmed from each end
fn trimmed_mean_overdispersion(overdispersions: ArrayView1<'_, f64>) -> f64 {
    let mut valid: Vec<f64> = overdispersions
        .iter()
        .filter(|&&d| d > MIN_TREND_OVERDISPERSION && d.is_finite())
        .copied()
        .collect();

    if valid.is_empty() {
        return 0.0;
    }
    valid.sort_by(f64::total_cmp);
    let n = valid.len();
    let trim = (n as f64 * 0.001).floor() as usize;
    let kept = &valid[trim..n - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}
