//! Fitted Gamma-Poisson models and the fitting interface

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::design::DesignMatrix;
use crate::data::{BlockParams, Counts};
use crate::dispersion::Overdispersion;
use crate::error::{Result, TransformError};

/// Result of a per-gene Gamma-Poisson GLM fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaPoissonFit {
    /// Coefficients (genes x coefficients), natural log scale
    pub beta: Array2<f64>,
    pub coefficient_names: Vec<String>,
    /// Fitted means (genes x samples)
    pub mu: Array2<f64>,
    /// Overdispersion used for the residuals, one per gene
    pub overdispersions: Array1<f64>,
    /// Mean-dependent trend of the overdispersions when shrinkage was requested
    pub overdispersion_trend: Option<Array1<f64>>,
    /// Raw per-gene estimates, kept after the trend has been substituted
    pub original_overdispersions: Option<Array1<f64>>,
    pub size_factors: Array1<f64>,
    pub design: Array2<f64>,
    pub deviances: Array1<f64>,
}

impl GammaPoissonFit {
    pub fn n_genes(&self) -> usize {
        self.mu.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.mu.ncols()
    }

    /// Replace the per-gene overdispersions by their fitted trend
    ///
    /// The raw estimates move to `original_overdispersions`. Calling this
    /// twice keeps the first set of raw estimates.
    pub fn substitute_trend(&mut self) -> Result<()> {
        let trend = self
            .overdispersion_trend
            .as_ref()
            .ok_or_else(|| TransformError::ModelFit {
                reason: "overdispersion shrinkage requested but the model has no trend".to_string(),
            })?;
        if trend.len() != self.overdispersions.len() {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} trended overdispersions", self.overdispersions.len()),
                got: format!("{} trended overdispersions", trend.len()),
            });
        }
        let original = std::mem::replace(&mut self.overdispersions, trend.clone());
        if self.original_overdispersions.is_none() {
            self.original_overdispersions = Some(original);
        }
        Ok(())
    }

    /// Ensure the fit describes a matrix of shape `dim`
    pub fn check_dim(&self, dim: (usize, usize)) -> Result<()> {
        if self.mu.dim() != dim
            || self.overdispersions.len() != dim.0
            || self.size_factors.len() != dim.1
        {
            return Err(TransformError::DimensionMismatch {
                expected: format!("model for {} genes x {} samples", dim.0, dim.1),
                got: format!(
                    "model with mu {:?}, {} overdispersions, {} size factors",
                    self.mu.dim(),
                    self.overdispersions.len(),
                    self.size_factors.len()
                ),
            });
        }
        Ok(())
    }
}

/// How the fitter should obtain overdispersions
#[derive(Debug, Clone, PartialEq)]
pub enum FitOverdispersion {
    /// Maximum likelihood per gene
    Estimate,
    /// Use given values; per-entry values are not supported by the GLM
    Fixed(Overdispersion),
}

/// Penalty `lambda^2 * (beta_k - target_k)^2` added to the deviance for selected coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgePenalty {
    pub lambda: f64,
    /// One target per coefficient; `None` leaves the coefficient unpenalized
    pub targets: Vec<Option<f64>>,
}

impl RidgePenalty {
    /// Shrink every coefficient except `unpenalized` toward zero
    pub fn toward_zero(lambda: f64, n_coefficients: usize, unpenalized: Option<usize>) -> Self {
        let targets = (0..n_coefficients)
            .map(|k| if Some(k) == unpenalized { None } else { Some(0.0) })
            .collect();
        Self { lambda, targets }
    }
}

/// Everything a [`ModelFitter`] needs for one fit
#[derive(Debug, Clone)]
pub struct FitRequest<'a> {
    pub counts: &'a Counts,
    pub design: &'a DesignMatrix,
    /// Offsets enter the model as log(size factor)
    pub size_factors: &'a Array1<f64>,
    pub overdispersion: FitOverdispersion,
    /// Also fit a mean-dependent trend of the overdispersions
    pub overdispersion_shrinkage: bool,
    pub ridge_penalty: Option<RidgePenalty>,
    pub block: BlockParams,
}

impl<'a> FitRequest<'a> {
    /// Intercept-only request with estimated overdispersion
    pub fn intercept_only(
        counts: &'a Counts,
        design: &'a DesignMatrix,
        size_factors: &'a Array1<f64>,
        block: BlockParams,
    ) -> Self {
        Self {
            counts,
            design,
            size_factors,
            overdispersion: FitOverdispersion::Estimate,
            overdispersion_shrinkage: false,
            ridge_penalty: None,
            block,
        }
    }
}

/// Fits a Gamma-Poisson GLM per gene
pub trait ModelFitter: Sync {
    fn fit(&self, request: &FitRequest<'_>) -> Result<GammaPoissonFit>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_fit() -> GammaPoissonFit {
        GammaPoissonFit {
            beta: array![[1.0], [2.0]],
            coefficient_names: vec!["Intercept".to_string()],
            mu: array![[2.0, 3.0], [7.0, 8.0]],
            overdispersions: array![0.4, 0.1],
            overdispersion_trend: Some(array![0.2, 0.15]),
            original_overdispersions: None,
            size_factors: array![1.0, 1.0],
            design: array![[1.0], [1.0]],
            deviances: array![0.0, 0.0],
        }
    }

    #[test]
    fn test_substitute_trend() {
        let mut fit = small_fit();
        fit.substitute_trend().unwrap();
        assert_eq!(fit.overdispersions, array![0.2, 0.15]);
        assert_eq!(fit.original_overdispersions, Some(array![0.4, 0.1]));

        fit.substitute_trend().unwrap();
        assert_eq!(fit.original_overdispersions, Some(array![0.4, 0.1]));
    }

    #[test]
    fn test_substitute_without_trend() {
        let mut fit = small_fit();
        fit.overdispersion_trend = None;
        assert!(matches!(fit.substitute_trend(), Err(TransformError::ModelFit { .. })));
    }

    #[test]
    fn test_check_dim() {
        let fit = small_fit();
        assert!(fit.check_dim((2, 2)).is_ok());
        assert!(fit.check_dim((3, 2)).is_err());
    }

    #[test]
    fn test_ridge_toward_zero() {
        let ridge = RidgePenalty::toward_zero(2.0, 3, Some(0));
        assert_eq!(ridge.targets, vec![None, Some(0.0), Some(0.0)]);
    }
}
