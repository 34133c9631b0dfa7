//! Model design matrices for the Gamma-Poisson fit

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::SampleMetadata;
use crate::error::{Result, TransformError};

/// Name of the covariate added when sequencing depth is modeled instead of offset
pub const LOG_DEPTH_COLUMN: &str = "log_size_factor";

/// Samples-by-coefficients design with named columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignMatrix {
    matrix: Array2<f64>,
    column_names: Vec<String>,
}

impl DesignMatrix {
    /// Validate and wrap a raw design matrix
    pub fn new(matrix: Array2<f64>, column_names: Vec<String>) -> Result<Self> {
        if column_names.len() != matrix.ncols() {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} column names", matrix.ncols()),
                got: format!("{} column names", column_names.len()),
            });
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(TransformError::InvalidInput {
                reason: "design matrix contains non-finite values".to_string(),
            });
        }
        check_full_rank(&matrix)?;
        Ok(Self { matrix, column_names })
    }

    /// Intercept-only model (~1)
    pub fn intercept(n_samples: usize) -> Self {
        Self {
            matrix: Array2::ones((n_samples, 1)),
            column_names: vec!["Intercept".to_string()],
        }
    }

    /// Treatment-contrast design for one categorical column of the metadata
    ///
    /// The alphabetically first level is the reference and gets no indicator.
    pub fn from_factor(metadata: &SampleMetadata, variable: &str) -> Result<Self> {
        let values = metadata.condition(variable).ok_or_else(|| TransformError::InvalidInput {
            reason: format!("variable '{}' not found in metadata", variable),
        })?;
        let levels = metadata.levels(variable)?;
        let n_samples = metadata.n_samples();

        if levels.len() <= 1 {
            return Ok(Self::intercept(n_samples));
        }

        let reference = &levels[0];
        let mut matrix = Array2::zeros((n_samples, levels.len()));
        for (i, value) in values.iter().enumerate() {
            matrix[[i, 0]] = 1.0;
            for (j, level) in levels.iter().enumerate().skip(1) {
                if value == level {
                    matrix[[i, j]] = 1.0;
                }
            }
        }

        let mut column_names = vec!["Intercept".to_string()];
        column_names.extend(
            levels
                .iter()
                .skip(1)
                .map(|level| format!("{}_{}_vs_{}", variable, level, reference)),
        );

        Self::new(matrix, column_names)
    }

    /// Append log(size factor) as a covariate
    pub fn with_log_depth_column(&self, size_factors: &Array1<f64>) -> Result<Self> {
        if size_factors.len() != self.n_samples() {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} size factors", self.n_samples()),
                got: format!("{} size factors", size_factors.len()),
            });
        }
        let log_depth = size_factors.mapv(f64::ln).insert_axis(Axis(1));
        let matrix = ndarray::concatenate![Axis(1), self.matrix, log_depth];

        let mut column_names = self.column_names.clone();
        column_names.push(LOG_DEPTH_COLUMN.to_string());
        Self::new(matrix, column_names)
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Index of the intercept column, if the design has one
    pub fn intercept_index(&self) -> Option<usize> {
        (0..self.n_coefficients()).find(|&j| self.matrix.column(j).iter().all(|&v| v == 1.0))
    }

    pub fn is_intercept_only(&self) -> bool {
        self.n_coefficients() == 1 && self.intercept_index() == Some(0)
    }
}

/// Reject rank-deficient designs
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let ncol = matrix.ncols();

    if matrix.nrows() == 0 || ncol == 0 {
        return Err(TransformError::InvalidInput {
            reason: "design matrix has zero rows or columns".to_string(),
        });
    }

    if qr_rank(matrix) < ncol {
        let has_zero_column = (0..ncol).any(|j| matrix.column(j).iter().all(|&v| v == 0.0));
        let reason = if has_zero_column {
            "design matrix is not full rank: a column is entirely zero"
        } else {
            "design matrix is not full rank: some columns are linear combinations of others"
        };
        return Err(TransformError::InvalidInput {
            reason: reason.to_string(),
        });
    }

    Ok(())
}

/// Numerical rank via Householder QR with column pivoting
///
/// Counts diagonal entries of R above `max(nrow, ncol) * eps * max|diag(R)|`.
fn qr_rank(matrix: &Array2<f64>) -> usize {
    let nrow = matrix.nrows();
    let ncol = matrix.ncols();
    let k = nrow.min(ncol);
    let mut r = matrix.to_owned();

    let mut col_norms_sq: Vec<f64> = (0..ncol)
        .map(|j| r.column(j).iter().map(|&v| v * v).sum())
        .collect();

    for step in 0..k {
        let best_col = (step..ncol)
            .max_by(|&a, &b| col_norms_sq[a].total_cmp(&col_norms_sq[b]))
            .unwrap_or(step);

        if best_col != step {
            for i in 0..nrow {
                r.swap([i, step], [i, best_col]);
            }
            col_norms_sq.swap(step, best_col);
        }

        let mut alpha = (step..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>().sqrt();
        if alpha < f64::EPSILON * 1e3 {
            break;
        }
        if r[[step, step]] > 0.0 {
            alpha = -alpha;
        }

        let v0 = r[[step, step]] - alpha;
        r[[step, step]] = alpha;

        let v_norm_sq = v0 * v0 + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, step]]).sum::<f64>();
        if v_norm_sq < f64::MIN_POSITIVE {
            continue;
        }
        let tau = 2.0 / v_norm_sq;

        for j in (step + 1)..ncol {
            let dot = v0 * r[[step, j]]
                + ((step + 1)..nrow).map(|i| r[[i, step]] * r[[i, j]]).sum::<f64>();
            let scale = tau * dot;
            r[[step, j]] -= scale * v0;
            for i in (step + 1)..nrow {
                r[[i, j]] -= scale * r[[i, step]];
            }
            col_norms_sq[j] = (col_norms_sq[j] - r[[step, j]] * r[[step, j]]).max(0.0);
        }
    }

    let max_abs_diag = (0..k).map(|i| r[[i, i]].abs()).fold(0.0f64, f64::max);
    let tol = nrow.max(ncol) as f64 * f64::EPSILON * max_abs_diag;
    (0..k).filter(|&i| r[[i, i]].abs() > tol).count()
}
