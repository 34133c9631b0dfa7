//! Size factor resolution: column totals, median of ratios, or user-supplied values
//!
//! Whatever the source, the returned size factors are strictly positive and
//! have mean 1, except when they come from a fitted model, which are used
//! verbatim.

use std::str::FromStr;

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::Counts;
use crate::error::{Result, TransformError};
use crate::glm::GammaPoissonFit;

/// Method for computing size factors from the counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeFactorMethod {
    /// Column totals divided by their mean
    NormedSum,
    /// Standard median of ratios
    Ratio,
    /// Median of ratios using positive counts only for the geometric mean
    PosCounts,
}

impl FromStr for SizeFactorMethod {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normed_sum" => Ok(SizeFactorMethod::NormedSum),
            "ratio" => Ok(SizeFactorMethod::Ratio),
            "poscounts" => Ok(SizeFactorMethod::PosCounts),
            other => Err(TransformError::InvalidInput {
                reason: format!(
                    "Unknown size factor method: {}. Use: normed_sum, ratio, or poscounts",
                    other
                ),
            }),
        }
    }
}

/// Where size factors come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeFactorSpec {
    /// Compute from the counts
    Auto(SizeFactorMethod),
    /// One value per sample, re-normalized to mean 1
    Fixed(Array1<f64>),
    /// No normalization (all ones)
    Unit,
    /// Take the size factors stored in a fitted model
    FromModel,
}

impl Default for SizeFactorSpec {
    fn default() -> Self {
        SizeFactorSpec::Auto(SizeFactorMethod::NormedSum)
    }
}

/// Resolve a size factor specification against a count matrix.
///
/// A supplied `model` takes precedence over `spec`: its size factors are
/// returned unchanged.
pub fn resolve_size_factors(
    spec: &SizeFactorSpec,
    counts: &Counts,
    model: Option<&GammaPoissonFit>,
) -> Result<Array1<f64>> {
    let n_samples = counts.n_samples();

    if let Some(fit) = model {
        if fit.size_factors.len() != n_samples {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} size factors", n_samples),
                got: format!("{} size factors in fitted model", fit.size_factors.len()),
            });
        }
        log::debug!("Using size factors from fitted model");
        return Ok(fit.size_factors.clone());
    }

    if n_samples == 0 {
        return Err(TransformError::EmptyData {
            reason: "Count matrix has no samples".to_string(),
        });
    }

    let raw = match spec {
        SizeFactorSpec::FromModel => {
            return Err(TransformError::InvalidInput {
                reason: "size factors requested from a model, but no fitted model was supplied".to_string(),
            })
        }
        SizeFactorSpec::Unit => return Ok(Array1::ones(n_samples)),
        SizeFactorSpec::Fixed(values) => {
            if values.len() != n_samples {
                return Err(TransformError::DimensionMismatch {
                    expected: format!("{} size factors", n_samples),
                    got: format!("{} size factors", values.len()),
                });
            }
            if let Some(bad) = values.iter().find(|&&x| !(x > 0.0 && x.is_finite())) {
                return Err(TransformError::InvalidSizeFactor {
                    reason: format!("size factors must be positive and finite, found {}", bad),
                });
            }
            values.clone()
        }
        SizeFactorSpec::Auto(method) => {
            log::debug!("Estimating size factors ({:?})", method);
            match method {
                SizeFactorMethod::NormedSum => normed_sum(counts)?,
                SizeFactorMethod::Ratio | SizeFactorMethod::PosCounts => {
                    if counts.is_blocked() {
                        return Err(TransformError::InvalidInput {
                            reason: format!(
                                "{:?} size factors need the full matrix in memory; use normed_sum for block-backed data",
                                method
                            ),
                        });
                    }
                    let dense = counts.to_dense()?;
                    if *method == SizeFactorMethod::Ratio {
                        estimate_size_factors_ratio(dense.view())?
                    } else {
                        estimate_size_factors_poscounts(dense.view())?
                    }
                }
            }
        }
    };

    Ok(normalize_to_unit_mean(raw))
}

/// Column totals, with zero-total columns lifted to the smallest positive total
fn normed_sum(counts: &Counts) -> Result<Array1<f64>> {
    let mut totals = counts.col_sums()?;
    let min_positive = totals
        .iter()
        .copied()
        .filter(|&x| x > 0.0)
        .fold(f64::INFINITY, f64::min);

    if !min_positive.is_finite() {
        return Err(TransformError::InvalidSizeFactor {
            reason: "all samples have zero total counts".to_string(),
        });
    }

    let n_empty = totals.iter().filter(|&&x| x <= 0.0).count();
    if n_empty > 0 {
        log::warn!(
            "{} sample(s) have zero total counts; using the smallest positive total as their size factor",
            n_empty
        );
        totals.mapv_inplace(|x| if x > 0.0 { x } else { min_positive });
    }
    Ok(totals)
}

fn normalize_to_unit_mean(mut size_factors: Array1<f64>) -> Array1<f64> {
    let mean = size_factors.mean().unwrap_or(1.0);
    size_factors.mapv_inplace(|x| x / mean);
    size_factors
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}

/// Standard median of ratios method
fn estimate_size_factors_ratio(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();

    if n_genes == 0 || n_samples == 0 {
        return Err(TransformError::EmptyData {
            reason: "Count matrix is empty".to_string(),
        });
    }

    // Geometric mean for each gene with all counts positive
    let mut geo_means = Vec::with_capacity(n_genes);
    let mut valid_genes = Vec::new();

    for (i, row) in counts.axis_iter(Axis(0)).enumerate() {
        if row.iter().all(|&x| x > 0.0) {
            let log_sum: f64 = row.iter().map(|&x| x.ln()).sum();
            geo_means.push((log_sum / n_samples as f64).exp());
            valid_genes.push(i);
        }
    }

    if valid_genes.is_empty() {
        return Err(TransformError::InvalidSizeFactor {
            reason: "No genes with all non-zero counts found; try poscounts or normed_sum".to_string(),
        });
    }

    let mut size_factors = Array1::zeros(n_samples);

    for j in 0..n_samples {
        let mut ratios: Vec<f64> = valid_genes
            .iter()
            .zip(geo_means.iter())
            .map(|(&i, &geo_mean)| counts[[i, j]] / geo_mean)
            .collect();
        size_factors[j] = median(&mut ratios);
    }

    if size_factors.iter().any(|&x| x <= 0.0 || !x.is_finite()) {
        return Err(TransformError::InvalidSizeFactor {
            reason: "Invalid size factors computed".to_string(),
        });
    }

    Ok(size_factors)
}

/// Median of ratios using positive counts for the geometric mean
fn estimate_size_factors_poscounts(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();

    if n_genes == 0 || n_samples == 0 {
        return Err(TransformError::EmptyData {
            reason: "Count matrix is empty".to_string(),
        });
    }

    let mut geo_means = Vec::with_capacity(n_genes);
    let mut valid_genes = Vec::new();

    for (i, row) in counts.axis_iter(Axis(0)).enumerate() {
        let positive: Vec<f64> = row.iter().filter(|&&x| x > 0.0).copied().collect();
        if !positive.is_empty() {
            // divide by the total number of samples, not just the positive ones
            let log_sum: f64 = positive.iter().map(|&x| x.ln()).sum();
            geo_means.push((log_sum / n_samples as f64).exp());
            valid_genes.push(i);
        }
    }

    if valid_genes.is_empty() {
        return Err(TransformError::InvalidSizeFactor {
            reason: "all samples have zero counts for all genes".to_string(),
        });
    }

    let mut size_factors = Array1::zeros(n_samples);

    for j in 0..n_samples {
        let mut ratios: Vec<f64> = valid_genes
            .iter()
            .zip(geo_means.iter())
            .filter_map(|(&i, &geo_mean)| {
                let count = counts[[i, j]];
                if count > 0.0 {
                    Some(count / geo_mean)
                } else {
                    None
                }
            })
            .collect();

        size_factors[j] = if ratios.is_empty() { 1.0 } else { median(&mut ratios) };
    }

    Ok(size_factors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{normalize, InputData};
    use ndarray::array;

    fn counts(m: ndarray::Array2<f64>) -> Counts {
        normalize(InputData::Dense(m)).unwrap().0
    }

    fn depth_example() -> Counts {
        counts(array![
            [100.0, 200.0, 80.0, 160.0],
            [500.0, 1000.0, 400.0, 800.0],
            [50.0, 100.0, 40.0, 80.0],
            [200.0, 400.0, 160.0, 320.0]
        ])
    }

    fn assert_unit_mean(sf: &Array1<f64>) {
        let mean = sf.mean().unwrap();
        assert!((mean - 1.0).abs() < 1e-12, "mean of size factors is {}", mean);
    }

    #[test]
    fn test_normed_sum() {
        let sf = resolve_size_factors(&SizeFactorSpec::default(), &depth_example(), None).unwrap();
        assert_eq!(sf.len(), 4);
        assert_unit_mean(&sf);
        assert!((sf[1] / sf[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ratio_and_poscounts() {
        for method in [SizeFactorMethod::Ratio, SizeFactorMethod::PosCounts] {
            let sf = resolve_size_factors(&SizeFactorSpec::Auto(method), &depth_example(), None).unwrap();
            assert_unit_mean(&sf);
            assert!(sf.iter().all(|&x| x > 0.0));
            assert!((sf[1] / sf[0] - 2.0).abs() < 0.1);
        }
    }

    #[test]
    fn test_fixed_is_renormalized() {
        let spec = SizeFactorSpec::Fixed(array![1.0, 2.0, 3.0, 2.0]);
        let sf = resolve_size_factors(&spec, &depth_example(), None).unwrap();
        assert_unit_mean(&sf);
        assert!((sf[2] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_wrong_length() {
        let spec = SizeFactorSpec::Fixed(array![1.0, 2.0]);
        let err = resolve_size_factors(&spec, &depth_example(), None);
        assert!(matches!(err, Err(TransformError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_fixed_non_positive() {
        let spec = SizeFactorSpec::Fixed(array![1.0, 0.0, 1.0, 1.0]);
        let err = resolve_size_factors(&spec, &depth_example(), None);
        assert!(matches!(err, Err(TransformError::InvalidSizeFactor { .. })));
    }

    #[test]
    fn test_all_zero_columns() {
        let zeros = counts(ndarray::Array2::zeros((3, 2)));
        let err = resolve_size_factors(&SizeFactorSpec::default(), &zeros, None);
        assert!(matches!(err, Err(TransformError::InvalidSizeFactor { .. })));
    }

    #[test]
    fn test_single_zero_column_stays_positive() {
        let m = counts(array![[1.0, 0.0, 3.0], [1.0, 0.0, 1.0]]);
        let sf = resolve_size_factors(&SizeFactorSpec::default(), &m, None).unwrap();
        assert!(sf.iter().all(|&x| x > 0.0));
        assert_unit_mean(&sf);
        assert!((sf[0] - sf[1]).abs() < 1e-12);
    }

    #[test]
    fn test_unit_and_missing_model() {
        let sf = resolve_size_factors(&SizeFactorSpec::Unit, &depth_example(), None).unwrap();
        assert_eq!(sf, Array1::<f64>::ones(4));
        assert!(resolve_size_factors(&SizeFactorSpec::FromModel, &depth_example(), None).is_err());
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("ratio".parse::<SizeFactorMethod>().unwrap(), SizeFactorMethod::Ratio);
        assert!("deconvolution".parse::<SizeFactorMethod>().is_err());
    }
}
