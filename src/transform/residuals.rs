//! Residual-based variance stabilization
//!
//! A Gamma-Poisson GLM is fitted per gene and the counts are replaced by
//! residuals of that fit. Pearson residuals are deterministic; randomized
//! quantile residuals draw one uniform per entry from a per-block stream.

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::data::{
    normalize, restore, BlockInfo, BlockMap, BlockParams, BlockSink, Counts, InputData, TransformedData,
};
use crate::dispersion::{Overdispersion, OverdispersionSpec};
use crate::error::{Result, TransformError};
use crate::glm::{
    residuals_block, DesignMatrix, FitOverdispersion, FitRequest, GammaPoissonFit, IrlsFitter, ModelFitter,
    ResidualKind, RidgePenalty,
};
use crate::normalization::{resolve_size_factors, SizeFactorSpec};
use crate::rng::{StreamFactory, UniformSource};

/// Ridge penalty on the depth slope when sequencing depth is a covariate
pub const DEFAULT_DEPTH_RIDGE: f64 = 2.0;

/// Bounds applied to the residuals after computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Clipping {
    None,
    /// Clip to ±sqrt(number of samples)
    SqrtSamples,
    /// Clip to ±value
    Value(f64),
}

impl Clipping {
    fn bound(&self, n_samples: usize) -> Result<Option<f64>> {
        match *self {
            Clipping::None => Ok(None),
            Clipping::SqrtSamples => Ok(Some((n_samples as f64).sqrt())),
            Clipping::Value(v) if v > 0.0 => Ok(Some(v)),
            Clipping::Value(v) => Err(TransformError::InvalidInput {
                reason: format!("clipping bound must be positive, got {}", v),
            }),
        }
    }
}

/// Configuration of the residual transform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualParams {
    pub kind: ResidualKind,
    /// Defaults to an intercept-only design
    pub design: Option<DesignMatrix>,
    /// Enter size factors as a fixed offset; otherwise log(size factor) becomes a covariate
    pub offset_model: bool,
    /// Ridge strength; without an offset this defaults to [`DEFAULT_DEPTH_RIDGE`]
    pub ridge_penalty: Option<f64>,
    pub overdispersion: OverdispersionSpec,
    /// Replace per-gene overdispersions by their mean-dependent trend
    pub overdispersion_shrinkage: bool,
    pub size_factors: SizeFactorSpec,
    pub clipping: Clipping,
    /// Return the fitted model alongside the residuals
    pub return_fit: bool,
    pub block: BlockParams,
}

impl Default for ResidualParams {
    fn default() -> Self {
        Self {
            kind: ResidualKind::RandomizedQuantile,
            design: None,
            offset_model: true,
            ridge_penalty: None,
            overdispersion: OverdispersionSpec::Estimate,
            overdispersion_shrinkage: false,
            size_factors: SizeFactorSpec::default(),
            clipping: Clipping::None,
            return_fit: false,
            block: BlockParams::default(),
        }
    }
}

/// Residuals and, on request, the model they came from
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    pub residuals: TransformedData,
    pub fit: Option<GammaPoissonFit>,
}

/// Residuals of one fitted model, computed block by block
struct ResidualKernel<'a> {
    kind: ResidualKind,
    fit: &'a GammaPoissonFit,
    streams: &'a dyn StreamFactory,
    clip: Option<f64>,
    n_clipped: AtomicUsize,
}

impl<'a> ResidualKernel<'a> {
    fn new(kind: ResidualKind, fit: &'a GammaPoissonFit, streams: &'a dyn StreamFactory, clip: Option<f64>) -> Self {
        Self {
            kind,
            fit,
            streams,
            clip,
            n_clipped: AtomicUsize::new(0),
        }
    }

    fn report(&self) {
        let n_clipped = self.n_clipped.load(Ordering::Relaxed);
        if n_clipped > 0 {
            log::info!("Clipped {} {} residuals", n_clipped, self.kind);
        }
    }
}

impl BlockMap for ResidualKernel<'_> {
    fn map_dense(&self, info: BlockInfo, block: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let rows = info.rows();
        let mu = self.fit.mu.slice(s![rows.clone(), ..]);
        let alphas = self.fit.overdispersions.slice(s![rows]);

        let mut stream = if self.kind.needs_randomness() {
            Some(self.streams.stream(info.index))
        } else {
            None
        };
        let source = stream.as_mut().map(|s| s.as_mut() as &mut dyn UniformSource);
        let mut out = residuals_block(self.kind, block, mu, alphas, source)?;

        if let Some(bound) = self.clip {
            let mut clipped = 0usize;
            out.mapv_inplace(|r| {
                if r.abs() > bound {
                    clipped += 1;
                    bound.copysign(r)
                } else {
                    r
                }
            });
            self.n_clipped.fetch_add(clipped, Ordering::Relaxed);
        }
        Ok(out)
    }
}

fn fit_overdispersion(spec: &OverdispersionSpec) -> Result<FitOverdispersion> {
    match spec {
        OverdispersionSpec::Estimate => Ok(FitOverdispersion::Estimate),
        OverdispersionSpec::Fixed(Overdispersion::PerEntry(_)) => Err(TransformError::InvalidInput {
            reason: "residuals need one overdispersion per gene, not per entry".to_string(),
        }),
        OverdispersionSpec::Fixed(values) => Ok(FitOverdispersion::Fixed(values.clone())),
        OverdispersionSpec::FromModel => Err(TransformError::InvalidInput {
            reason: "overdispersions from a model: pass the model to residuals_from_fit".to_string(),
        }),
    }
}

/// Design, offsets and penalty actually handed to the fitter
fn model_setup(
    params: &ResidualParams,
    n_samples: usize,
    size_factors: Array1<f64>,
) -> Result<(DesignMatrix, Array1<f64>, Option<RidgePenalty>)> {
    let design = match &params.design {
        Some(design) if design.n_samples() != n_samples => {
            return Err(TransformError::DimensionMismatch {
                expected: format!("design with {} rows", n_samples),
                got: format!("design with {} rows", design.n_samples()),
            })
        }
        Some(design) => design.clone(),
        None => DesignMatrix::intercept(n_samples),
    };
    if let Some(lambda) = params.ridge_penalty {
        if !(lambda >= 0.0) || !lambda.is_finite() {
            return Err(TransformError::InvalidInput {
                reason: format!("ridge penalty must be finite and non-negative, got {}", lambda),
            });
        }
    }

    if params.offset_model {
        let ridge = params
            .ridge_penalty
            .map(|lambda| RidgePenalty::toward_zero(lambda, design.n_coefficients(), design.intercept_index()));
        return Ok((design, size_factors, ridge));
    }

    // Depth enters as a covariate whose slope is shrunk toward 1
    let with_depth = design.with_log_depth_column(&size_factors)?;
    let mut targets = vec![None; design.n_coefficients()];
    targets.push(Some(1.0));
    let ridge = RidgePenalty {
        lambda: params.ridge_penalty.unwrap_or(DEFAULT_DEPTH_RIDGE),
        targets,
    };
    let unit = Array1::ones(n_samples);
    Ok((with_depth, unit, Some(ridge)))
}

/// Check a fit against the data and apply the requested trend substitution
fn finalize_fit(mut fit: GammaPoissonFit, dim: (usize, usize), params: &ResidualParams) -> Result<GammaPoissonFit> {
    fit.check_dim(dim)?;
    if params.overdispersion_shrinkage {
        fit.substitute_trend()?;
    }
    Ok(fit)
}

/// Validate `params` and fit the model for `counts`
fn fit_model(counts: &Counts, params: &ResidualParams, fitter: &dyn ModelFitter) -> Result<GammaPoissonFit> {
    let (n_genes, n_samples) = counts.dim();
    params.clipping.bound(n_samples)?;
    let overdispersion = fit_overdispersion(&params.overdispersion)?;

    let size_factors = resolve_size_factors(&params.size_factors, counts, None)?;
    let (design, offsets, ridge_penalty) = model_setup(params, n_samples, size_factors)?;

    log::info!(
        "Computing {} residuals for {} genes x {} samples ({})",
        params.kind,
        n_genes,
        n_samples,
        if params.offset_model { "offset model" } else { "depth covariate" }
    );
    let request = FitRequest {
        counts,
        design: &design,
        size_factors: &offsets,
        overdispersion,
        overdispersion_shrinkage: params.overdispersion_shrinkage,
        ridge_penalty,
        block: params.block.clone(),
    };
    let fit = fitter.fit(&request)?;
    finalize_fit(fit, (n_genes, n_samples), params)
}

fn compute_residuals(
    counts: &Counts,
    was_vector: bool,
    fit: GammaPoissonFit,
    params: &ResidualParams,
    streams: &dyn StreamFactory,
) -> Result<ResidualOutput> {
    let clip = params.clipping.bound(counts.n_samples())?;
    let kernel = ResidualKernel::new(params.kind, &fit, streams, clip);
    let residuals = counts.apply_blockwise(&kernel, &params.block)?;
    kernel.report();

    Ok(ResidualOutput {
        residuals: restore(residuals, was_vector)?,
        fit: if params.return_fit { Some(fit) } else { None },
    })
}

/// Residual transform with the built-in IRLS fitter
pub fn residual_transform(
    input: impl Into<InputData>,
    params: &ResidualParams,
    streams: &dyn StreamFactory,
) -> Result<ResidualOutput> {
    residual_transform_with(input, params, streams, &IrlsFitter::default())
}

/// Fit a Gamma-Poisson model with `fitter` and return its residuals
///
/// Errors from the fitter are returned unchanged.
pub fn residual_transform_with(
    input: impl Into<InputData>,
    params: &ResidualParams,
    streams: &dyn StreamFactory,
    fitter: &dyn ModelFitter,
) -> Result<ResidualOutput> {
    let (counts, was_vector) = normalize(input.into())?;
    let fit = fit_model(&counts, params, fitter)?;
    compute_residuals(&counts, was_vector, fit, params, streams)
}

/// Fit, then hand the residuals to `sink` one block at a time
///
/// Returns the fit when `params.return_fit` is set.
pub fn residual_transform_into(
    counts: &Counts,
    params: &ResidualParams,
    streams: &dyn StreamFactory,
    fitter: &dyn ModelFitter,
    sink: &mut dyn BlockSink,
) -> Result<Option<GammaPoissonFit>> {
    let fit = fit_model(counts, params, fitter)?;
    let clip = params.clipping.bound(counts.n_samples())?;
    let kernel = ResidualKernel::new(params.kind, &fit, streams, clip);
    counts.apply_blockwise_into(&kernel, &params.block, sink)?;
    kernel.report();
    Ok(if params.return_fit { Some(fit) } else { None })
}

/// Residuals of an already fitted model
///
/// Only `kind`, `overdispersion_shrinkage`, `clipping`, `return_fit` and
/// `block` of `params` are used.
pub fn residuals_from_fit(
    input: impl Into<InputData>,
    fit: GammaPoissonFit,
    params: &ResidualParams,
    streams: &dyn StreamFactory,
) -> Result<ResidualOutput> {
    let (counts, was_vector) = normalize(input.into())?;
    let fit = finalize_fit(fit, counts.dim(), params)?;
    compute_residuals(&counts, was_vector, fit, params, streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glm::{quantile_residual, LOG_DEPTH_COLUMN};
    use crate::rng::SeededStreams;
    use crate::data::InMemoryBlocks;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Poisson};

    fn simulate(n_genes: usize, n_samples: usize, alpha: f64, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let depth: Array1<f64> = (0..n_samples).map(|j| 0.5 + (j % 4) as f64 * 0.4).collect();
        let mut counts = Array2::zeros((n_genes, n_samples));
        for gene in 0..n_genes {
            let mean = 2.0 + (gene % 20) as f64 * 3.0;
            for sample in 0..n_samples {
                let mu = mean * depth[sample];
                let gamma = Gamma::new(1.0 / alpha, mu * alpha).unwrap();
                let lambda: f64 = gamma.sample(&mut rng);
                counts[[gene, sample]] = Poisson::new(lambda.max(1e-12)).unwrap().sample(&mut rng);
            }
        }
        (counts, depth)
    }

    fn hand_fit() -> GammaPoissonFit {
        GammaPoissonFit {
            beta: array![[2.0_f64.ln()]],
            coefficient_names: vec!["Intercept".to_string()],
            mu: array![[2.0, 2.0, 2.0]],
            overdispersions: array![0.1],
            overdispersion_trend: None,
            original_overdispersions: None,
            size_factors: array![1.0, 1.0, 1.0],
            design: array![[1.0], [1.0], [1.0]],
            deviances: array![0.0],
        }
    }

    fn pearson_params() -> ResidualParams {
        ResidualParams {
            kind: ResidualKind::Pearson,
            ..ResidualParams::default()
        }
    }

    #[test]
    fn test_pearson_from_fit_hand_values() {
        let counts = array![[0.0, 5.0, 10.0]];
        let out = residuals_from_fit(counts, hand_fit(), &pearson_params(), &SeededStreams::default()).unwrap();
        let r = out.residuals.to_dense().unwrap();
        let sd = 2.4_f64.sqrt();
        assert!((r[[0, 0]] + 2.0 / sd).abs() < 1e-12);
        assert!((r[[0, 1]] - 3.0 / sd).abs() < 1e-12);
        assert!((r[[0, 2]] - 8.0 / sd).abs() < 1e-12);
        assert!(out.fit.is_none());
    }

    #[test]
    fn test_clipping() {
        let counts = array![[0.0, 5.0, 10.0]];
        let mut params = pearson_params();
        params.clipping = Clipping::SqrtSamples;
        let r = residuals_from_fit(counts.clone(), hand_fit(), &params, &SeededStreams::default())
            .unwrap()
            .residuals
            .to_dense()
            .unwrap();
        let bound = 3.0_f64.sqrt();
        assert!((r[[0, 0]] + 2.0 / 2.4_f64.sqrt()).abs() < 1e-12);
        assert_eq!(r[[0, 1]], bound);
        assert_eq!(r[[0, 2]], bound);

        params.clipping = Clipping::Value(1.0);
        let r = residuals_from_fit(counts.clone(), hand_fit(), &params, &SeededStreams::default())
            .unwrap()
            .residuals
            .to_dense()
            .unwrap();
        assert_eq!(r, array![[-1.0, 1.0, 1.0]]);

        params.clipping = Clipping::Value(0.0);
        assert!(residuals_from_fit(counts, hand_fit(), &params, &SeededStreams::default()).is_err());
    }

    #[test]
    fn test_injected_stream_at_midpoint_matches_quantile() {
        let counts = array![[0.0, 1.0, 4.0]];
        let half = |_block: usize| -> Box<dyn UniformSource + Send> { Box::new(|| 0.5) };
        let params = ResidualParams {
            kind: ResidualKind::RandomizedQuantile,
            ..ResidualParams::default()
        };
        let r = residuals_from_fit(counts, hand_fit(), &params, &half)
            .unwrap()
            .residuals
            .to_dense()
            .unwrap();
        for (j, y) in [0.0, 1.0, 4.0].iter().enumerate() {
            assert!((r[[0, j]] - quantile_residual(*y, 2.0, 0.1)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_seeded_reproducibility() {
        let (counts, _) = simulate(30, 12, 0.1, 5);
        let params = ResidualParams {
            overdispersion: OverdispersionSpec::Fixed(Overdispersion::Scalar(0.1)),
            block: BlockParams { block_rows: 7 },
            ..ResidualParams::default()
        };
        let run = |seed: u64| {
            residual_transform(counts.clone(), &params, &SeededStreams::new(seed))
                .unwrap()
                .residuals
                .to_dense()
                .unwrap()
        };
        let first = run(42);
        assert_eq!(first, run(42));
        assert_ne!(first, run(43));
    }

    #[test]
    fn test_randomized_residuals_are_standard_normal() {
        let (counts, _) = simulate(200, 40, 0.2, 17);
        let out = residual_transform(counts, &ResidualParams::default(), &SeededStreams::new(3)).unwrap();
        let r = out.residuals.to_dense().unwrap();
        let n = r.len() as f64;
        let mean = r.sum() / n;
        let var = r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn test_shrinkage_keeps_original_estimates() {
        let (counts, _) = simulate(60, 10, 0.3, 23);
        let params = ResidualParams {
            kind: ResidualKind::Pearson,
            overdispersion_shrinkage: true,
            return_fit: true,
            ..ResidualParams::default()
        };
        let out = residual_transform(counts, &params, &SeededStreams::default()).unwrap();
        let fit = out.fit.unwrap();
        let trend = fit.overdispersion_trend.clone().unwrap();
        assert_eq!(fit.overdispersions, trend);
        let original = fit.original_overdispersions.unwrap();
        assert_eq!(original.len(), 60);
        assert_ne!(original, trend);
    }

    #[test]
    fn test_depth_covariate_model() {
        let (counts, _) = simulate(40, 16, 0.1, 31);
        let params = ResidualParams {
            kind: ResidualKind::Pearson,
            offset_model: false,
            ridge_penalty: Some(50.0),
            return_fit: true,
            ..ResidualParams::default()
        };
        let fit = residual_transform(counts, &params, &SeededStreams::default())
            .unwrap()
            .fit
            .unwrap();
        assert_eq!(fit.coefficient_names.last().map(String::as_str), Some(LOG_DEPTH_COLUMN));
        assert!(fit.size_factors.iter().all(|&s| s == 1.0));
        // a strong penalty keeps the depth slope close to its target of 1
        let slopes = fit.beta.column(1);
        let mean_slope = slopes.sum() / slopes.len() as f64;
        assert!((mean_slope - 1.0).abs() < 0.1, "slope {}", mean_slope);
    }

    #[test]
    fn test_rejected_overdispersion_requests() {
        let counts = array![[1.0, 2.0], [3.0, 4.0]];
        for spec in [
            OverdispersionSpec::FromModel,
            OverdispersionSpec::Fixed(Overdispersion::PerEntry(array![[0.1, 0.1], [0.1, 0.1]])),
        ] {
            let params = ResidualParams {
                overdispersion: spec,
                ..ResidualParams::default()
            };
            assert!(matches!(
                residual_transform(counts.clone(), &params, &SeededStreams::default()),
                Err(TransformError::InvalidInput { .. })
            ));
        }
    }

    #[test]
    fn test_fitter_errors_propagate() {
        struct Failing;
        impl ModelFitter for Failing {
            fn fit(&self, _request: &FitRequest<'_>) -> Result<GammaPoissonFit> {
                Err(TransformError::ModelFit {
                    reason: "no convergence".to_string(),
                })
            }
        }
        let result = residual_transform_with(
            array![[1.0, 2.0]],
            &pearson_params(),
            &SeededStreams::default(),
            &Failing,
        );
        match result {
            Err(TransformError::ModelFit { reason }) => assert_eq!(reason, "no convergence"),
            other => panic!("expected the fitter's error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        let (counts, _) = simulate(25, 8, 0.1, 41);
        let params = ResidualParams {
            overdispersion: OverdispersionSpec::Fixed(Overdispersion::Scalar(0.1)),
            block: BlockParams { block_rows: 10 },
            ..ResidualParams::default()
        };
        let streams = SeededStreams::new(9);
        let in_memory = residual_transform(counts.clone(), &params, &streams)
            .unwrap()
            .residuals
            .to_dense()
            .unwrap();

        let mut sink = InMemoryBlocks::new(8);
        let (matrix, _) = normalize(InputData::Dense(counts)).unwrap();
        residual_transform_into(&matrix, &params, &streams, &IrlsFitter::default(), &mut sink).unwrap();
        assert_eq!(sink.to_dense().unwrap(), in_memory);
    }

    #[test]
    fn test_wrong_model_shape() {
        let counts = array![[1.0, 2.0]];
        assert!(matches!(
            residuals_from_fit(counts, hand_fit(), &pearson_params(), &SeededStreams::default()),
            Err(TransformError::DimensionMismatch { .. })
        ));
    }
}
