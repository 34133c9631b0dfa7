//! Delta-method variance-stabilizing transforms
//!
//! For Gamma-Poisson counts with variance `mu + alpha * mu^2`, the delta
//! method gives `g(x) = acosh(2 alpha x + 1) / sqrt(alpha)`, with limit
//! `2 sqrt(x)` as alpha goes to zero. The shifted logarithm
//! `log(4 alpha x + 1) / sqrt(alpha)` approximates it for large counts.
//! Both map a zero count to exactly zero, so sparse inputs stay sparse.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::data::{
    normalize, restore, BlockInfo, BlockMap, BlockParams, BlockSink, Counts, InputData, StoredEntry, TransformedData,
};
use crate::dispersion::{resolve_overdispersion, Overdispersion, OverdispersionSpec};
use crate::error::{Result, TransformError};
use crate::glm::{GammaPoissonFit, IrlsFitter, ModelFitter};
use crate::normalization::{resolve_size_factors, SizeFactorSpec};

/// Overdispersions closer to zero than this use the square-root limit
pub const ZERO_OVERDISPERSION_TOL: f64 = 1.5e-8;

/// Floor applied to the overdispersion of the shifted logarithm
pub const DEFAULT_MINIMUM_OVERDISPERSION: f64 = 0.001;

/// Which closed form to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaFamily {
    Acosh,
    ShiftedLog,
}

impl DeltaFamily {
    /// Closed form at a non-zero overdispersion
    #[inline]
    pub fn apply(&self, x: f64, alpha: f64) -> f64 {
        match self {
            DeltaFamily::Acosh => acosh_single(x, alpha),
            DeltaFamily::ShiftedLog => shifted_log_single(x, alpha),
        }
    }
}

/// acosh(2 alpha x + 1) / sqrt(alpha), evaluated as acosh1p to stay exact near zero
#[inline]
pub fn acosh_single(x: f64, alpha: f64) -> f64 {
    let z = 2.0 * alpha * x;
    (z + (z * (z + 2.0)).sqrt()).ln_1p() / alpha.sqrt()
}

/// log1p(4 alpha x) / sqrt(alpha)
#[inline]
pub fn shifted_log_single(x: f64, alpha: f64) -> f64 {
    (4.0 * alpha * x).ln_1p() / alpha.sqrt()
}

/// Zero-overdispersion limit of both transforms
#[inline]
pub fn sqrt_limit(x: f64) -> f64 {
    2.0 * x.sqrt()
}

/// Configuration of the delta-method transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaParams {
    pub overdispersion: OverdispersionSpec,
    pub size_factors: SizeFactorSpec,
    /// Alternative encoding `c = 1 / (4 alpha)`; takes precedence over `overdispersion`
    pub pseudo_count: Option<Overdispersion>,
    /// Floor on the overdispersion of the shifted logarithm (not used by acosh)
    pub minimum_overdispersion: f64,
    pub block: BlockParams,
}

impl Default for DeltaParams {
    fn default() -> Self {
        Self {
            overdispersion: OverdispersionSpec::default(),
            size_factors: SizeFactorSpec::default(),
            pseudo_count: None,
            minimum_overdispersion: DEFAULT_MINIMUM_OVERDISPERSION,
            block: BlockParams::default(),
        }
    }
}

/// Entries whose overdispersion is effectively zero
#[derive(Debug, Clone, PartialEq)]
pub enum ZeroMask {
    /// One flag per gene
    Genes(Vec<bool>),
    /// One flag per entry
    Entries(Array2<bool>),
}

impl ZeroMask {
    #[inline]
    fn is_zero(&self, gene: usize, sample: usize) -> bool {
        match self {
            ZeroMask::Genes(flags) => flags[gene],
            ZeroMask::Entries(flags) => flags[[gene, sample]],
        }
    }
}

/// How the overdispersions split between the square-root limit and the closed form
#[derive(Debug, Clone, PartialEq)]
pub enum DispersionRegime {
    AllZero,
    NoneZero,
    Mixed(ZeroMask),
}

impl DispersionRegime {
    pub fn classify(alpha: &Overdispersion) -> Self {
        let is_zero = |a: f64| a.abs() < ZERO_OVERDISPERSION_TOL;
        let from_flags = |n_zero: usize, n: usize, mask: ZeroMask| {
            if n_zero == n {
                DispersionRegime::AllZero
            } else if n_zero == 0 {
                DispersionRegime::NoneZero
            } else {
                DispersionRegime::Mixed(mask)
            }
        };

        match alpha {
            Overdispersion::Scalar(a) => {
                if is_zero(*a) {
                    DispersionRegime::AllZero
                } else {
                    DispersionRegime::NoneZero
                }
            }
            Overdispersion::PerGene(v) => {
                let flags: Vec<bool> = v.iter().map(|&a| is_zero(a)).collect();
                let n_zero = flags.iter().filter(|&&z| z).count();
                from_flags(n_zero, flags.len(), ZeroMask::Genes(flags))
            }
            Overdispersion::PerEntry(m) => {
                let flags = m.mapv(is_zero);
                let n_zero = flags.iter().filter(|&&z| z).count();
                from_flags(n_zero, flags.len(), ZeroMask::Entries(flags))
            }
        }
    }
}

/// A resolved delta-method transform, applied block by block
#[derive(Debug, Clone)]
pub struct DeltaKernel {
    family: DeltaFamily,
    alpha: Overdispersion,
    size_factors: Array1<f64>,
    regime: DispersionRegime,
}

impl DeltaKernel {
    pub fn family(&self) -> DeltaFamily {
        self.family
    }

    pub fn overdispersion(&self) -> &Overdispersion {
        &self.alpha
    }

    pub fn size_factors(&self) -> &Array1<f64> {
        &self.size_factors
    }

    pub fn regime(&self) -> &DispersionRegime {
        &self.regime
    }

    #[inline]
    fn value(&self, gene: usize, sample: usize, count: f64) -> f64 {
        let x = count / self.size_factors[sample];
        let zero = match &self.regime {
            DispersionRegime::AllZero => true,
            DispersionRegime::NoneZero => false,
            DispersionRegime::Mixed(mask) => mask.is_zero(gene, sample),
        };
        if zero {
            sqrt_limit(x)
        } else {
            self.family.apply(x, self.alpha.at(gene, sample))
        }
    }

    fn transform_all_zero(&self, block: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = block.to_owned();
        for mut row in out.rows_mut() {
            for (value, &s) in row.iter_mut().zip(self.size_factors.iter()) {
                *value = sqrt_limit(*value / s);
            }
        }
        out
    }

    fn transform_none_zero(&self, info: BlockInfo, block: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = block.to_owned();
        for ((local, sample), value) in out.indexed_iter_mut() {
            let alpha = self.alpha.at(info.row_offset + local, sample);
            *value = self.family.apply(*value / self.size_factors[sample], alpha);
        }
        out
    }

    fn transform_mixed(&self, info: BlockInfo, block: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = block.to_owned();
        for ((local, sample), value) in out.indexed_iter_mut() {
            *value = self.value(info.row_offset + local, sample, *value);
        }
        out
    }
}

impl BlockMap for DeltaKernel {
    fn preserves_zeros(&self) -> bool {
        true
    }

    fn map_dense(&self, info: BlockInfo, block: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Ok(match &self.regime {
            DispersionRegime::AllZero => self.transform_all_zero(block),
            DispersionRegime::NoneZero => self.transform_none_zero(info, block),
            DispersionRegime::Mixed(_) => self.transform_mixed(info, block),
        })
    }

    fn map_stored(&self, _info: BlockInfo, entries: &mut [StoredEntry]) -> Result<()> {
        for entry in entries.iter_mut() {
            entry.value = self.value(entry.gene, entry.sample, entry.value);
        }
        Ok(())
    }
}

/// Resolve size factors and overdispersions for `counts` into a kernel
///
/// A pseudo-count, when given, replaces the overdispersion request. For the
/// shifted logarithm the overdispersions are raised to
/// `params.minimum_overdispersion`.
pub fn prepare_delta(
    counts: &Counts,
    family: DeltaFamily,
    params: &DeltaParams,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
) -> Result<DeltaKernel> {
    let dim = counts.dim();

    let pseudo_count = match &params.pseudo_count {
        Some(pc) => {
            let pc = pc.clone().conform(dim, "pseudo-counts")?;
            if let Some(bad) = pc.values().find(|&c| c <= 0.0) {
                return Err(TransformError::InvalidInput {
                    reason: format!("pseudo-counts must be positive, got {}", bad),
                });
            }
            Some(pc)
        }
        None => None,
    };
    if !(params.minimum_overdispersion >= 0.0) {
        return Err(TransformError::InvalidInput {
            reason: format!(
                "minimum overdispersion must be non-negative, got {}",
                params.minimum_overdispersion
            ),
        });
    }

    let size_factors = resolve_size_factors(&params.size_factors, counts, model)?;

    let alpha = match pseudo_count {
        Some(pc) => {
            log::debug!("Deriving overdispersion from pseudo-count");
            pc.map(|c| 1.0 / (4.0 * c))
        }
        None => resolve_overdispersion(&params.overdispersion, counts, &size_factors, model, fitter, &params.block)?,
    };

    let alpha = match family {
        DeltaFamily::ShiftedLog => {
            let floor = params.minimum_overdispersion;
            alpha.map(|a| a.max(floor))
        }
        DeltaFamily::Acosh => alpha,
    };

    let regime = DispersionRegime::classify(&alpha);
    log::info!(
        "{:?} transform of {} genes x {} samples ({})",
        family,
        dim.0,
        dim.1,
        match &regime {
            DispersionRegime::AllZero => "square-root limit",
            DispersionRegime::NoneZero => "closed form",
            DispersionRegime::Mixed(_) => "mixed",
        }
    );

    Ok(DeltaKernel {
        family,
        alpha,
        size_factors,
        regime,
    })
}

fn delta_transform(
    input: InputData,
    family: DeltaFamily,
    params: &DeltaParams,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
) -> Result<TransformedData> {
    let (counts, was_vector) = normalize(input)?;
    let kernel = prepare_delta(&counts, family, params, model, fitter)?;
    let transformed = counts.apply_blockwise(&kernel, &params.block)?;
    restore(transformed, was_vector)
}

/// Transform `counts` block by block, handing each block to `sink` in order
///
/// Only one block of output is resident at a time, also for block-backed input.
pub fn delta_transform_into(
    counts: &Counts,
    family: DeltaFamily,
    params: &DeltaParams,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
    sink: &mut dyn BlockSink,
) -> Result<()> {
    let kernel = prepare_delta(counts, family, params, model, fitter)?;
    counts.apply_blockwise_into(&kernel, &params.block, sink)
}

/// acosh transform with the built-in fitter for estimated overdispersions
pub fn acosh_transform(input: impl Into<InputData>, params: &DeltaParams) -> Result<TransformedData> {
    acosh_transform_with(input, params, None, &IrlsFitter::default())
}

/// acosh transform using an optional fitted model and a custom fitter
pub fn acosh_transform_with(
    input: impl Into<InputData>,
    params: &DeltaParams,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
) -> Result<TransformedData> {
    delta_transform(input.into(), DeltaFamily::Acosh, params, model, fitter)
}

/// Shifted-log transform with the built-in fitter for estimated overdispersions
pub fn shifted_log_transform(input: impl Into<InputData>, params: &DeltaParams) -> Result<TransformedData> {
    shifted_log_transform_with(input, params, None, &IrlsFitter::default())
}

pub fn shifted_log_transform_with(
    input: impl Into<InputData>,
    params: &DeltaParams,
    model: Option<&GammaPoissonFit>,
    fitter: &dyn ModelFitter,
) -> Result<TransformedData> {
    delta_transform(input.into(), DeltaFamily::ShiftedLog, params, model, fitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BlockedCounts, InMemoryBlocks};
    use ndarray::{array, s, Array1};
    use sprs::TriMat;

    fn unit_params(alpha: Overdispersion) -> DeltaParams {
        DeltaParams {
            overdispersion: OverdispersionSpec::Fixed(alpha),
            size_factors: SizeFactorSpec::Unit,
            ..DeltaParams::default()
        }
    }

    fn dense(result: TransformedData) -> Array2<f64> {
        match result {
            TransformedData::Dense(m) => m,
            other => panic!("expected dense output, got {:?}", other),
        }
    }

    #[test]
    fn test_acosh_monotone_and_zero() {
        for &alpha in &[1e-6, 0.01, 0.5, 10.0] {
            assert_eq!(acosh_single(0.0, alpha), 0.0);
            let mut prev = 0.0;
            for i in 1..200 {
                let v = acosh_single(i as f64 * 0.37, alpha);
                assert!(v > prev, "not increasing at alpha={}", alpha);
                prev = v;
            }
        }
    }

    #[test]
    fn test_acosh_matches_std_acosh() {
        let (x, alpha) = (25.0_f64, 0.2_f64);
        let expected = (2.0 * alpha * x + 1.0).acosh() / alpha.sqrt();
        assert!((acosh_single(x, alpha) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_small_alpha_approaches_sqrt() {
        for &x in &[0.0, 0.5, 3.0, 100.0] {
            assert!((acosh_single(x, 1e-10) - sqrt_limit(x)).abs() < 1e-6, "x = {}", x);
        }
        // leading error term is 2 sqrt(x) * alpha * x / 6
        let x = 1e4_f64;
        for &alpha in &[1e-8, 1e-10, 1e-12] {
            let gap = sqrt_limit(x) - acosh_single(x, alpha);
            let leading = sqrt_limit(x) * alpha * x / 6.0;
            assert!((gap - leading).abs() < 0.05 * leading + 1e-9, "alpha = {}", alpha);
        }
    }

    #[test]
    fn test_log_and_acosh_converge() {
        // acosh(1 + z) = log(2 + 2z) + O(1/z), so both tend to log(4 alpha x) / sqrt(alpha)
        let alpha = 0.05;
        let gap = |x: f64| acosh_single(x, alpha) - shifted_log_single(x, alpha);
        assert_eq!(gap(0.0), 0.0);
        assert!(gap(1e2) > gap(1e4));
        assert!(gap(1e4) > gap(1e6));
        assert!(gap(1e8).abs() < 1e-3);
    }

    #[test]
    fn test_all_zero_row_stays_zero() {
        let counts = array![[0.0, 0.0, 0.0], [1.0, 5.0, 20.0]];
        for alpha in [0.0, 0.05, 3.0] {
            let out = dense(acosh_transform(counts.clone(), &unit_params(Overdispersion::Scalar(alpha))).unwrap());
            assert!(out.row(0).iter().all(|&v| v == 0.0));
            let out = dense(shifted_log_transform(counts.clone(), &unit_params(Overdispersion::Scalar(alpha))).unwrap());
            assert!(out.row(0).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_mixed_equals_separate_halves() {
        let counts = array![[1.0, 4.0, 9.0], [0.0, 2.0, 30.0], [7.0, 0.0, 3.0], [12.0, 15.0, 1.0]];
        let alphas = array![0.0, 0.0, 0.2, 0.2];
        let mut params = unit_params(Overdispersion::PerGene(alphas));
        params.block = BlockParams { block_rows: 3 };
        let mixed = dense(acosh_transform(counts.clone(), &params).unwrap());

        let top = dense(
            acosh_transform(counts.slice(s![0..2, ..]).to_owned(), &unit_params(Overdispersion::Scalar(0.0))).unwrap(),
        );
        let bottom = dense(
            acosh_transform(counts.slice(s![2..4, ..]).to_owned(), &unit_params(Overdispersion::Scalar(0.2))).unwrap(),
        );
        assert_eq!(mixed.slice(s![0..2, ..]), top);
        assert_eq!(mixed.slice(s![2..4, ..]), bottom);
    }

    #[test]
    fn test_regime_classification() {
        assert_eq!(DispersionRegime::classify(&Overdispersion::Scalar(1e-9)), DispersionRegime::AllZero);
        assert_eq!(
            DispersionRegime::classify(&Overdispersion::PerGene(array![0.1, 0.2])),
            DispersionRegime::NoneZero
        );
        assert_eq!(
            DispersionRegime::classify(&Overdispersion::PerGene(array![0.0, 0.2])),
            DispersionRegime::Mixed(ZeroMask::Genes(vec![true, false]))
        );
        assert!(matches!(
            DispersionRegime::classify(&Overdispersion::PerEntry(array![[0.0, 0.2]])),
            DispersionRegime::Mixed(ZeroMask::Entries(_))
        ));
    }

    #[test]
    fn test_per_entry_overdispersion() {
        let counts = array![[4.0, 9.0]];
        let params = unit_params(Overdispersion::PerEntry(array![[0.0, 0.5]]));
        let out = dense(acosh_transform(counts, &params).unwrap());
        assert_eq!(out[[0, 0]], 4.0);
        assert!((out[[0, 1]] - acosh_single(9.0, 0.5)).abs() < 1e-15);
    }

    #[test]
    fn test_size_factors_divide_columns() {
        let counts = array![[2.0, 8.0]];
        let params = DeltaParams {
            overdispersion: OverdispersionSpec::Fixed(Overdispersion::Scalar(0.0)),
            size_factors: SizeFactorSpec::Fixed(array![0.5, 2.0]),
            ..DeltaParams::default()
        };
        // Renormalized to mean 1: [0.4, 1.6]
        let out = dense(acosh_transform(counts, &params).unwrap());
        assert!((out[[0, 0]] - sqrt_limit(2.0 / 0.4)).abs() < 1e-12);
        assert!((out[[0, 1]] - sqrt_limit(8.0 / 1.6)).abs() < 1e-12);
    }

    #[test]
    fn test_shifted_log_floor_and_pseudo_count() {
        let counts = array![[10.0]];
        let floored = dense(shifted_log_transform(counts.clone(), &unit_params(Overdispersion::Scalar(0.0))).unwrap());
        assert!((floored[[0, 0]] - shifted_log_single(10.0, 0.001)).abs() < 1e-12);

        let mut params = unit_params(Overdispersion::Scalar(0.3));
        params.pseudo_count = Some(Overdispersion::Scalar(1.0));
        let out = dense(shifted_log_transform(counts.clone(), &params).unwrap());
        assert!((out[[0, 0]] - shifted_log_single(10.0, 0.25)).abs() < 1e-12);

        params.pseudo_count = Some(Overdispersion::Scalar(0.0));
        assert!(matches!(
            shifted_log_transform(counts, &params),
            Err(TransformError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_vector_round_trip() {
        let v = Array1::from_vec(vec![0.0, 1.0, 4.0, 9.0]);
        match acosh_transform(v, &unit_params(Overdispersion::Scalar(0.0))).unwrap() {
            TransformedData::Vector(out) => assert_eq!(out, array![0.0, 2.0, 4.0, 6.0]),
            other => panic!("expected a vector, got {:?}", other),
        }
    }

    #[test]
    fn test_sparse_stays_sparse() {
        let mut tri = TriMat::new((3, 2));
        tri.add_triplet(0, 0, 4.0);
        tri.add_triplet(2, 1, 9.0);
        let sparse: sprs::CsMat<f64> = tri.to_csr();
        let out = acosh_transform(sparse, &unit_params(Overdispersion::Scalar(0.1))).unwrap();
        match out {
            TransformedData::Sparse(m) => {
                assert_eq!(m.nnz(), 2);
                let v = m.get(2, 1).copied().unwrap_or(0.0);
                assert!((v - acosh_single(9.0, 0.1)).abs() < 1e-12);
            }
            other => panic!("expected sparse output, got {:?}", other),
        }
    }

    #[test]
    fn test_blocked_input_into_sink() {
        let counts = array![[0.0, 3.0, 8.0], [1.0, 0.0, 2.0], [5.0, 5.0, 5.0], [0.0, 0.0, 0.0]];
        let params = DeltaParams {
            block: BlockParams { block_rows: 3 },
            ..unit_params(Overdispersion::Scalar(0.2))
        };
        let expected = dense(acosh_transform(counts.clone(), &params).unwrap());

        let store = InMemoryBlocks::from_dense(&counts, &params.block);
        let (blocked, _) = normalize(InputData::Blocked(BlockedCounts::new(store))).unwrap();
        let mut sink = InMemoryBlocks::new(3);
        delta_transform_into(&blocked, DeltaFamily::Acosh, &params, None, &IrlsFitter::default(), &mut sink).unwrap();
        assert_eq!(sink.to_dense().unwrap(), expected);
    }

    #[test]
    fn test_wrong_overdispersion_length() {
        let counts = array![[1.0, 2.0], [3.0, 4.0]];
        let params = unit_params(Overdispersion::PerGene(array![0.1, 0.2, 0.3]));
        assert!(matches!(
            acosh_transform(counts, &params),
            Err(TransformError::DimensionMismatch { .. })
        ));
    }
}
