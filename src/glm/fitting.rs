//! Gamma-Poisson GLM fitting using Iteratively Reweighted Least Squares (IRLS)

use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::model::{FitOverdispersion, FitRequest, GammaPoissonFit, ModelFitter, RidgePenalty};
use super::negative_binomial::{nb_mean, nb_unit_deviance, nb_weight};
use crate::dispersion::{
    fit_overdispersion_trend, moments_overdispersion, overdispersion_mle, DispersionParams, Overdispersion,
};
use crate::error::{Result, TransformError};

/// Coefficients beyond this magnitude (natural log scale) stop the iteration
pub const MAX_BETA: f64 = 30.0;

/// Floor on the mean inside the IRLS weights and working response
const MIN_MU: f64 = 1e-8;

/// Ridge added to every coefficient to keep X'WX invertible
const STABILIZING_RIDGE: f64 = 1e-6;

/// Configurable parameters for GLM fitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmFitParams {
    /// Maximum IRLS iterations
    pub maxit: usize,
    /// Relative deviance change that counts as converged
    pub tol: f64,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        Self { maxit: 100, tol: 1e-8 }
    }
}

/// Fit of one gene at a fixed overdispersion
#[derive(Debug, Clone)]
pub struct GeneFit {
    pub beta: Vec<f64>,
    pub mu: Vec<f64>,
    pub deviance: f64,
    pub converged: bool,
}

/// Per-coefficient penalty weights and targets entering the normal equations
struct PenaltyTerms {
    weight: Vec<f64>,
    target: Vec<f64>,
}

impl PenaltyTerms {
    fn new(n_coefs: usize, ridge: Option<&RidgePenalty>) -> Self {
        let mut weight = vec![STABILIZING_RIDGE; n_coefs];
        let mut target = vec![0.0; n_coefs];
        if let Some(ridge) = ridge {
            let lambda_sq = ridge.lambda * ridge.lambda;
            for (k, t) in ridge.targets.iter().enumerate().take(n_coefs) {
                if let Some(t) = t {
                    weight[k] += lambda_sq;
                    target[k] = *t;
                }
            }
        }
        Self { weight, target }
    }

    fn value(&self, beta: &[f64]) -> f64 {
        beta.iter()
            .zip(self.weight.iter().zip(&self.target))
            .map(|(b, (w, t))| w * (b - t).powi(2))
            .sum()
    }
}

fn linear_predictor(design: &Array2<f64>, beta: &[f64], sample: usize) -> f64 {
    beta.iter().enumerate().map(|(j, b)| design[[sample, j]] * b).sum()
}

fn means(design: &Array2<f64>, beta: &[f64], size_factors: ArrayView1<'_, f64>) -> Vec<f64> {
    (0..design.nrows())
        .map(|i| nb_mean(linear_predictor(design, beta, i), size_factors[i]))
        .collect()
}

/// Fit one gene at overdispersion `alpha` with offsets log(size factor)
///
/// Starts from least squares on log(y / s + 0.1), then iterates weighted
/// least squares until the penalized deviance stabilizes. A gene without any
/// counts gets zero means and an intercept of minus infinity.
pub fn fit_single_gene(
    counts: ArrayView1<'_, f64>,
    design: &Array2<f64>,
    size_factors: ArrayView1<'_, f64>,
    alpha: f64,
    ridge: Option<&RidgePenalty>,
    params: &GlmFitParams,
) -> GeneFit {
    let n_samples = counts.len();
    let n_coefs = design.ncols();

    if counts.iter().all(|&y| y == 0.0) {
        let mut beta = vec![0.0; n_coefs];
        if let Some(ic) = (0..n_coefs).find(|&j| design.column(j).iter().all(|&v| v == 1.0)) {
            beta[ic] = f64::NEG_INFINITY;
        }
        return GeneFit {
            beta,
            mu: vec![0.0; n_samples],
            deviance: 0.0,
            converged: true,
        };
    }

    let penalty = PenaltyTerms::new(n_coefs, ridge);

    let log_counts: Vec<f64> = counts
        .iter()
        .zip(size_factors.iter())
        .map(|(&y, &s)| (y / s + 0.1).ln())
        .collect();
    let mut beta = weighted_least_squares(design, &vec![1.0; n_samples], &log_counts, &penalty);
    if beta.iter().any(|b| !b.is_finite()) {
        let mean = counts.iter().zip(size_factors.iter()).map(|(&y, &s)| y / s).sum::<f64>() / n_samples as f64;
        beta = vec![0.0; n_coefs];
        beta[0] = mean.max(0.1).ln();
    }

    let deviance_of = |mu: &[f64], beta: &[f64]| -> f64 {
        counts
            .iter()
            .zip(mu)
            .map(|(&y, &m)| nb_unit_deviance(y, m, alpha))
            .sum::<f64>()
            + penalty.value(beta)
    };

    let mut mu = means(design, &beta, size_factors);
    let mut dev_old = deviance_of(&mu, &beta);
    let mut converged = false;

    let mut weights = vec![0.0; n_samples];
    let mut working_response = vec![0.0; n_samples];

    for _ in 0..params.maxit {
        for i in 0..n_samples {
            let m = mu[i].max(MIN_MU);
            weights[i] = nb_weight(m, alpha);
            working_response[i] = (m / size_factors[i]).ln() + (counts[i] - m) / m;
        }

        beta = weighted_least_squares(design, &weights, &working_response, &penalty);
        mu = means(design, &beta, size_factors);

        if beta.iter().any(|b| !b.is_finite() || b.abs() > MAX_BETA) {
            break;
        }

        let dev = deviance_of(&mu, &beta);
        let change = (dev - dev_old).abs() / (dev.abs() + 0.1);
        if change.is_nan() {
            break;
        }
        if change < params.tol {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    let deviance = counts
        .iter()
        .zip(&mu)
        .map(|(&y, &m)| nb_unit_deviance(y, m, alpha))
        .sum();

    GeneFit {
        beta,
        mu,
        deviance,
        converged,
    }
}

/// Solve (X'WX + diag(p)) beta = X'Wz + diag(p) t
fn weighted_least_squares(design: &Array2<f64>, weights: &[f64], response: &[f64], penalty: &PenaltyTerms) -> Vec<f64> {
    let n_coefs = design.ncols();
    let mut xtwx = vec![0.0; n_coefs * n_coefs];
    let mut xtwz = vec![0.0; n_coefs];

    for i in 0..design.nrows() {
        let w = weights[i];
        for j in 0..n_coefs {
            let wx = w * design[[i, j]];
            for k in 0..n_coefs {
                xtwx[j * n_coefs + k] += wx * design[[i, k]];
            }
            xtwz[j] += wx * response[i];
        }
    }

    for j in 0..n_coefs {
        xtwx[j * n_coefs + j] += penalty.weight[j];
        xtwz[j] += penalty.weight[j] * penalty.target[j];
    }

    solve_symmetric_system(&xtwx, &xtwz, n_coefs)
}

/// Cholesky solve of a symmetric positive definite system (row-major `a`)
fn solve_symmetric_system(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                l[i * n + j] = sum.max(1e-12).sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = b[i] - (0..i).map(|j| l[i * n + j] * y[j]).sum::<f64>();
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = y[i] - ((i + 1)..n).map(|j| l[j * n + i] * x[j]).sum::<f64>();
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Result for one gene inside a block
struct GeneResult {
    fit: GeneFit,
    alpha: f64,
    normalized_mean: f64,
}

/// Built-in [`ModelFitter`]: IRLS per gene with maximum likelihood overdispersion
///
/// With estimated overdispersion each gene is fit three times: at the moments
/// estimate, then the overdispersion is maximized with the means held fixed,
/// and the coefficients are refit at that value. Genes within a block are fit
/// in parallel; blocks are visited one at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrlsFitter {
    pub glm: GlmFitParams,
    pub dispersion: DispersionParams,
}

impl IrlsFitter {
    pub fn new(glm: GlmFitParams, dispersion: DispersionParams) -> Self {
        Self { glm, dispersion }
    }

    fn fit_gene(
        &self,
        counts: ArrayView1<'_, f64>,
        design: &Array2<f64>,
        size_factors: ArrayView1<'_, f64>,
        fixed_alpha: Option<f64>,
        ridge: Option<&RidgePenalty>,
    ) -> GeneResult {
        let normalized_mean = counts
            .iter()
            .zip(size_factors.iter())
            .map(|(&y, &s)| y / s)
            .sum::<f64>()
            / counts.len().max(1) as f64;

        let alpha = match fixed_alpha {
            Some(alpha) => alpha,
            None => {
                let start = moments_overdispersion(counts, size_factors);
                let first = fit_single_gene(counts, design, size_factors, start, ridge, &self.glm);
                overdispersion_mle(counts, ArrayView1::from(&first.mu[..]), &self.dispersion)
            }
        };

        GeneResult {
            fit: fit_single_gene(counts, design, size_factors, alpha, ridge, &self.glm),
            alpha,
            normalized_mean,
        }
    }
}

fn validate_request(request: &FitRequest<'_>) -> Result<Option<Overdispersion>> {
    let (n_genes, n_samples) = request.counts.dim();
    let n_coefs = request.design.n_coefficients();

    if request.design.n_samples() != n_samples {
        return Err(TransformError::DimensionMismatch {
            expected: format!("design with {} rows", n_samples),
            got: format!("design with {} rows", request.design.n_samples()),
        });
    }
    if request.size_factors.len() != n_samples {
        return Err(TransformError::DimensionMismatch {
            expected: format!("{} size factors", n_samples),
            got: format!("{} size factors", request.size_factors.len()),
        });
    }
    if request.size_factors.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
        return Err(TransformError::InvalidSizeFactor {
            reason: "size factors must be positive and finite".to_string(),
        });
    }
    if let Some(ridge) = &request.ridge_penalty {
        if ridge.targets.len() != n_coefs {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} ridge targets", n_coefs),
                got: format!("{} ridge targets", ridge.targets.len()),
            });
        }
        if !(ridge.lambda >= 0.0) || !ridge.lambda.is_finite() {
            return Err(TransformError::InvalidInput {
                reason: format!("ridge penalty must be finite and non-negative, got {}", ridge.lambda),
            });
        }
    }

    match &request.overdispersion {
        FitOverdispersion::Estimate => Ok(None),
        FitOverdispersion::Fixed(Overdispersion::PerEntry(_)) => Err(TransformError::InvalidInput {
            reason: "a per-entry overdispersion cannot be used to fit a model".to_string(),
        }),
        FitOverdispersion::Fixed(values) => values
            .clone()
            .conform((n_genes, n_samples), "overdispersions")
            .map(Some),
    }
}

impl ModelFitter for IrlsFitter {
    fn fit(&self, request: &FitRequest<'_>) -> Result<GammaPoissonFit> {
        let fixed = validate_request(request)?;
        let (n_genes, n_samples) = request.counts.dim();
        let design = request.design.matrix();
        let n_coefs = design.ncols();
        let size_factors = request.size_factors.view();
        let ridge = request.ridge_penalty.as_ref();

        log::info!(
            "Fitting Gamma-Poisson GLM: {} genes, {} samples, {} coefficients",
            n_genes,
            n_samples,
            n_coefs
        );

        let mut beta = Array2::zeros((n_genes, n_coefs));
        let mut mu = Array2::zeros((n_genes, n_samples));
        let mut overdispersions = Array1::zeros(n_genes);
        let mut deviances = Array1::zeros(n_genes);
        let mut normalized_means = Array1::zeros(n_genes);
        let mut n_unconverged = 0usize;

        request.counts.visit_blocks(&request.block, |info, block| {
            let results: Vec<GeneResult> = (0..info.n_rows)
                .into_par_iter()
                .map(|local| {
                    let gene = info.row_offset + local;
                    let fixed_alpha = fixed.as_ref().map(|a| a.at(gene, 0));
                    self.fit_gene(block.row(local), design, size_factors, fixed_alpha, ridge)
                })
                .collect();

            for (local, result) in results.into_iter().enumerate() {
                let gene = info.row_offset + local;
                if result.fit.mu.iter().any(|m| !m.is_finite()) {
                    return Err(TransformError::ModelFit {
                        reason: format!("non-finite fitted means for gene {}", gene),
                    });
                }
                if !result.fit.converged {
                    n_unconverged += 1;
                }
                for (j, b) in result.fit.beta.iter().enumerate() {
                    beta[[gene, j]] = *b;
                }
                for (j, m) in result.fit.mu.iter().enumerate() {
                    mu[[gene, j]] = *m;
                }
                overdispersions[gene] = result.alpha;
                deviances[gene] = result.fit.deviance;
                normalized_means[gene] = result.normalized_mean;
            }
            log::debug!("Fitted block {} ({} genes)", info.index, info.n_rows);
            Ok(())
        })?;

        if n_unconverged > 0 {
            log::warn!("{} genes did not converge", n_unconverged);
        }

        let overdispersion_trend = if request.overdispersion_shrinkage {
            if fixed.is_some() {
                log::warn!("Overdispersions are fixed; their trend is the values themselves");
                Some(overdispersions.clone())
            } else {
                Some(fit_overdispersion_trend(normalized_means.view(), overdispersions.view()))
            }
        } else {
            None
        };

        Ok(GammaPoissonFit {
            beta,
            coefficient_names: request.design.column_names().to_vec(),
            mu,
            overdispersions,
            overdispersion_trend,
            original_overdispersions: None,
            size_factors: request.size_factors.clone(),
            design: design.clone(),
            deviances,
        })
    }
}
