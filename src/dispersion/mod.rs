//! Overdispersion values and their resolution
//!
//! An overdispersion request is either a fixed value (scalar, per gene or
//! per entry), a request to estimate it with an intercept-only model, or a
//! request to take it from a fitted model.

mod gene_wise;
mod trend;

pub use gene_wise::{moments_overdispersion, overdispersion_mle};
pub use trend::fit_overdispersion_trend;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::data::{BlockParams, Counts};
use crate::error::{Result, TransformError};
use crate::glm::{DesignMatrix, FitRequest, GammaPoissonFit, ModelFitter};

/// Default fixed overdispersion of the delta-method transforms
pub const DEFAULT_OVERDISPERSION: f64 = 0.05;

/// Parameters of the per-gene maximum likelihood search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispersionParams {
    /// Lower end of the search range
    pub min_overdispersion: f64,
    /// Upper end of the search range
    pub max_overdispersion: f64,
    /// Points of the coarse log-scale grid
    pub grid_points: usize,
    /// Width of the final bracket on the log scale
    pub tol: f64,
    pub maxit: usize,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_overdispersion: 1e-8,
            max_overdispersion: 1e4,
            grid_points: 20,
            tol: 1e-6,
            maxit: 100,
        }
    }
}

/// Overdispersion values shaped like the data they apply to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Overdispersion {
    Scalar(f64),
    PerGene(Array1<f64>),
    PerEntry(Array2<f64>),
}

impl Overdispersion {
    /// Value for entry (gene, sample)
    #[inline]
    pub fn at(&self, gene: usize, sample: usize) -> f64 {
        match self {
            Overdispersion::Scalar(a) => *a,
            Overdispersion::PerGene(v) => v[gene],
            Overdispersion::PerEntry(m) => m[[gene, sample]],
        }
    }

    /// Apply `f` to every value, keeping the shape
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        match self {
            Overdispersion::Scalar(a) => Overdispersion::Scalar(f(*a)),
            Overdispersion::PerGene(v) => Overdispersion::PerGene(v.mapv(f)),
            Overdispersion::PerEntry(m) => Overdispersion::PerEntry(m.mapv(f)),
        }
    }

    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            Overdispersion::Scalar(a) => Box::new(std::iter::once(*a)),
            Overdispersion::PerGene(v) => Box::new(v.iter().copied()),
            Overdispersion::PerEntry(m) => Box::new(m.iter().copied()),
        }
    }

    /// Check shape against a (genes, samples) matrix, broadcasting a
    /// single-element gene vector to every gene
    pub fn conform(self, dim: (usize, usize), what: &str) -> Result<Self> {
        let conformed = match self {
            Overdispersion::PerGene(v) if v.len() == 1 && dim.0 != 1 => {
                Overdispersion::PerGene(Array1::from_elem(dim.0, v[0]))
            }
            Overdispersion::PerGene(v) if v.len() != dim.0 => {
                return Err(TransformError::DimensionMismatch {
                    expected: format!("{} {} (one per gene)", dim.0, what),
                    got: format!("{} {}", v.len(), what),
                });
            }
            Overdispersion::PerEntry(m) if m.dim() != dim => {
                return Err(TransformError::DimensionMismatch {
                    expected: format!("{} x {} {}", dim.0, dim.1, what),
                    got: format!("{} x {} {}", m.nrows(), m.ncols(), what),
                });
            }
            other => other,
        };

        if let Some(bad) = conformed.values().find(|v| !(*v >= 0.0) || v.is_infinite()) {
            return Err(TransformError::InvalidInput {
                reason: format!("{} must be finite and non-negative, got {}", what, bad),
            });
        }
        Ok(conformed)
    }
}

impl From<f64> for Overdispersion {
    fn from(value: f64) -> Self {
        Overdispersion::Scalar(value)
    }
}

impl From<Array1<f64>> for Overdispersion {
    fn from(values: Array1<f64>) -> Self {
        Overdispersion::PerGene(values)
    }
}

impl From<Array2<f64>> for Overdispersion {
    fn from(values: Array2<f64>) -> Self {
        Overdispersion::PerEntry(values)
    }
}

/// Where the overdispersion comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverdispersionSpec {
    /// Estimate per gene with an intercept-only Gamma-Poisson model
    Estimate,
    Fixed(Overdispersion),
    /// Take the per-gene values of a fitted model
    FromModel,
}

impl Default for OverdispersionSpec {
    fn default() -> Self {
        OverdispersionSpec::Fixed(Overdispersion::Scalar(DEFAULT_OVERDISPERSION))
    }
}

impl std::str::FromStr for OverdispersionSpec {
    type Err = TransformError;

    /// "estimate", "model" or a number
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "estimate" | "true" => Ok(OverdispersionSpec::Estimate),
            "model" => Ok(OverdispersionSpec::FromModel),
            "poisson" | "false" => Ok(OverdispersionSpec::Fixed(Overdispersion::Scalar(0.0))),
            other => other
                .parse::<f64>()
                .map(|a| OverdispersionSpec::Fixed(Overdispersion::Scalar(a)))
                .map_err(|_| TransformError::InvalidInput {
                    reason: format!("cannot interpret '{}' as an overdispersion", s),
                }),
        }
    }
}

/// Resolve an overdispersion request against the data
///
/// Fixed values are shape-checked and validated; `Estimate` fits an
/// intercept-only model through `fitter`; `FromModel` reads the model's
/// per-gene values.
pub fn resolve_overdispersion(
    spec: &OverdispersionSpec,
    counts: &Counts,
    size_factors: &Array1<f64>,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
    block: &BlockParams,
) -> Result<Overdispersion> {
    let dim = counts.dim();
    match spec {
        OverdispersionSpec::Fixed(values) => values.clone().conform(dim, "overdispersions"),
        OverdispersionSpec::FromModel => {
            let model = model.ok_or_else(|| TransformError::InvalidInput {
                reason: "overdispersion from model requested but no model was supplied".to_string(),
            })?;
            Overdispersion::PerGene(model.overdispersions.clone()).conform(dim, "overdispersions")
        }
        OverdispersionSpec::Estimate => {
            log::info!("Estimating overdispersions for {} genes", dim.0);
            let design = DesignMatrix::intercept(dim.1);
            let request = FitRequest::intercept_only(counts, &design, size_factors, block.clone());
            let fit = fitter.fit(&request)?;
            Overdispersion::PerGene(fit.overdispersions).conform(dim, "overdispersions")
        }
    }
}
