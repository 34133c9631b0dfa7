//! Uniform access to dense, sparse, vector and block-backed count data
//!
//! Inputs are normalized into [`Counts`], which offers the few capabilities
//! the transforms need: dimensions, row/column totals and block-wise
//! application of a [`BlockMap`] that keeps the storage class of the input.

use ndarray::{s, Array1, Array2, ArrayD, ArrayView2, Axis, Ix1, Ix2};
use rayon::prelude::*;
use sprs::CsMat;

use super::blocks::{BlockInfo, BlockMap, BlockParams, BlockSink, BlockedCounts, InMemoryBlocks, StoredEntry};
use crate::error::{Result, TransformError};

/// Count data as handed to a transform
#[derive(Debug, Clone)]
pub enum InputData {
    /// One count per gene, treated as a single-sample matrix
    Vector(Array1<f64>),
    /// Genes x samples, in memory
    Dense(Array2<f64>),
    /// Genes x samples, compressed sparse storage
    Sparse(CsMat<f64>),
    /// Genes x samples, read block by block
    Blocked(BlockedCounts),
}

impl InputData {
    /// Accept a dynamically-dimensioned array of one or two dimensions
    pub fn from_dyn(array: ArrayD<f64>) -> Result<Self> {
        match array.ndim() {
            1 => array
                .into_dimensionality::<Ix1>()
                .map(InputData::Vector)
                .map_err(|e| TransformError::InvalidInputKind {
                    reason: e.to_string(),
                }),
            2 => array
                .into_dimensionality::<Ix2>()
                .map(InputData::Dense)
                .map_err(|e| TransformError::InvalidInputKind {
                    reason: e.to_string(),
                }),
            n => Err(TransformError::InvalidInputKind {
                reason: format!("expected a vector or a 2-dimensional matrix, got {} dimensions", n),
            }),
        }
    }
}

impl From<Array1<f64>> for InputData {
    fn from(v: Array1<f64>) -> Self {
        InputData::Vector(v)
    }
}

impl From<Array2<f64>> for InputData {
    fn from(m: Array2<f64>) -> Self {
        InputData::Dense(m)
    }
}

impl From<CsMat<f64>> for InputData {
    fn from(m: CsMat<f64>) -> Self {
        InputData::Sparse(m)
    }
}

impl From<BlockedCounts> for InputData {
    fn from(b: BlockedCounts) -> Self {
        InputData::Blocked(b)
    }
}

/// Transformed values, in the storage class of the input
#[derive(Debug, Clone)]
pub enum TransformedData {
    Vector(Array1<f64>),
    Dense(Array2<f64>),
    Sparse(CsMat<f64>),
    Blocked(BlockedCounts),
}

impl TransformedData {
    /// (genes, samples); a vector reports one sample
    pub fn dim(&self) -> (usize, usize) {
        match self {
            TransformedData::Vector(v) => (v.len(), 1),
            TransformedData::Dense(m) => m.dim(),
            TransformedData::Sparse(m) => (m.rows(), m.cols()),
            TransformedData::Blocked(b) => b.dim(),
        }
    }

    /// Materialize as a dense genes x samples matrix
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        match self {
            TransformedData::Vector(v) => Ok(v.clone().insert_axis(Axis(1))),
            TransformedData::Dense(m) => Ok(m.clone()),
            TransformedData::Sparse(m) => Ok(sparse_rows_to_dense(m, 0..m.rows())),
            TransformedData::Blocked(b) => b.values_to_dense(),
        }
    }
}

/// Normalized count matrix, genes x samples
#[derive(Debug, Clone)]
pub enum Counts {
    Dense(Array2<f64>),
    /// Always stored in CSR order (one outer vector per gene)
    Sparse(CsMat<f64>),
    Blocked(BlockedCounts),
}

/// Reject entries that are not finite non-negative numbers
pub(crate) fn check_count_values<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> Result<()> {
    for &x in values {
        if !x.is_finite() || x < 0.0 {
            return Err(TransformError::InvalidInputKind {
                reason: format!("counts must be non-negative finite numbers, found {}", x),
            });
        }
    }
    Ok(())
}

/// Turn any accepted input into a [`Counts`] matrix.
///
/// Returns the matrix and whether the input was a vector (which becomes a
/// one-column matrix).
pub fn normalize(input: InputData) -> Result<(Counts, bool)> {
    match input {
        InputData::Vector(v) => {
            check_count_values(v.iter())?;
            Ok((Counts::Dense(v.insert_axis(Axis(1))), true))
        }
        InputData::Dense(m) => {
            check_count_values(m.iter())?;
            Ok((Counts::Dense(m), false))
        }
        InputData::Sparse(m) => {
            check_count_values(m.data().iter())?;
            let m = if m.is_csr() { m } else { m.to_csr() };
            Ok((Counts::Sparse(m), false))
        }
        // block contents are checked as each block is read
        InputData::Blocked(b) => Ok((Counts::Blocked(b), false)),
    }
}

/// Undo [`normalize`]: a one-column result of a vector input becomes a vector again
pub fn restore(counts: Counts, was_vector: bool) -> Result<TransformedData> {
    if !was_vector {
        return Ok(match counts {
            Counts::Dense(m) => TransformedData::Dense(m),
            Counts::Sparse(m) => TransformedData::Sparse(m),
            Counts::Blocked(b) => TransformedData::Blocked(b),
        });
    }
    let dense = match counts {
        Counts::Dense(m) => m,
        Counts::Sparse(m) => sparse_rows_to_dense(&m, 0..m.rows()),
        Counts::Blocked(b) => b.values_to_dense()?,
    };
    if dense.ncols() != 1 {
        return Err(TransformError::DimensionMismatch {
            expected: "a single column for vector output".to_string(),
            got: format!("{} columns", dense.ncols()),
        });
    }
    Ok(TransformedData::Vector(dense.column(0).to_owned()))
}

/// Densify a range of CSR rows
fn sparse_rows_to_dense(m: &CsMat<f64>, rows: std::ops::Range<usize>) -> Array2<f64> {
    let mut dense = Array2::zeros((rows.len(), m.cols()));
    for (local, gene) in rows.enumerate() {
        if let Some(row) = m.outer_view(gene) {
            for (sample, &value) in row.iter() {
                dense[[local, sample]] = value;
            }
        }
    }
    dense
}

impl Counts {
    /// (genes, samples)
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Counts::Dense(m) => m.dim(),
            Counts::Sparse(m) => (m.rows(), m.cols()),
            Counts::Blocked(b) => b.dim(),
        }
    }

    pub fn n_genes(&self) -> usize {
        self.dim().0
    }

    pub fn n_samples(&self) -> usize {
        self.dim().1
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Counts::Blocked(_))
    }

    /// Row ranges of the blocks this matrix is processed in
    pub fn block_ranges(&self, params: &BlockParams) -> Vec<std::ops::Range<usize>> {
        match self {
            Counts::Blocked(b) => (0..b.n_blocks()).map(|i| b.block_info(i).rows()).collect(),
            _ => params.ranges(self.n_genes()),
        }
    }

    /// Per-sample totals (library sizes)
    pub fn col_sums(&self) -> Result<Array1<f64>> {
        match self {
            Counts::Dense(m) => Ok(m.sum_axis(Axis(0))),
            Counts::Sparse(m) => {
                let mut sums = Array1::zeros(m.cols());
                for row in m.outer_iterator() {
                    for (sample, &value) in row.iter() {
                        sums[sample] += value;
                    }
                }
                Ok(sums)
            }
            Counts::Blocked(b) => {
                let mut sums = Array1::zeros(b.dim().1);
                for index in 0..b.n_blocks() {
                    sums += &b.read_block(index)?.sum_axis(Axis(0));
                }
                Ok(sums)
            }
        }
    }

    /// Per-gene totals
    pub fn row_sums(&self) -> Result<Array1<f64>> {
        match self {
            Counts::Dense(m) => Ok(m.sum_axis(Axis(1))),
            Counts::Sparse(m) => Ok(m
                .outer_iterator()
                .map(|row| row.iter().map(|(_, &v)| v).sum::<f64>())
                .collect()),
            Counts::Blocked(b) => {
                let mut sums = Vec::with_capacity(b.dim().0);
                for index in 0..b.n_blocks() {
                    sums.extend(b.read_block(index)?.sum_axis(Axis(1)));
                }
                Ok(Array1::from_vec(sums))
            }
        }
    }

    /// Materialize the whole matrix densely
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        match self {
            Counts::Dense(m) => Ok(m.clone()),
            Counts::Sparse(m) => Ok(sparse_rows_to_dense(m, 0..m.rows())),
            Counts::Blocked(b) => b.to_dense(),
        }
    }

    /// Visit every block as a dense array, in order, one at a time
    pub fn visit_blocks<F>(&self, params: &BlockParams, mut f: F) -> Result<()>
    where
        F: FnMut(BlockInfo, ArrayView2<'_, f64>) -> Result<()>,
    {
        for (index, rows) in self.block_ranges(params).into_iter().enumerate() {
            let info = BlockInfo::new(index, &rows);
            match self {
                Counts::Dense(m) => f(info, m.slice(s![rows, ..]))?,
                Counts::Sparse(m) => {
                    let block = sparse_rows_to_dense(m, rows);
                    f(info, block.view())?
                }
                Counts::Blocked(b) => {
                    let block = b.read_block(index)?;
                    f(info, block.view())?
                }
            }
        }
        Ok(())
    }

    /// Apply `map` to every block, keeping the storage class of the input.
    ///
    /// In-memory blocks are processed in parallel. Block-backed inputs are
    /// read one block at a time, but the whole output is collected in an
    /// [`InMemoryBlocks`]; use [`Counts::apply_blockwise_into`] to keep the
    /// output out of memory as well.
    pub fn apply_blockwise(&self, map: &dyn BlockMap, params: &BlockParams) -> Result<Counts> {
        match self {
            Counts::Dense(m) => {
                let ranges = params.ranges(m.nrows());
                let blocks: Vec<Array2<f64>> = ranges
                    .par_iter()
                    .enumerate()
                    .map(|(index, rows)| {
                        let info = BlockInfo::new(index, rows);
                        let block = m.slice(s![rows.clone(), ..]);
                        let out = map.map_dense(info, block)?;
                        check_block_shape(info, m.ncols(), &out)?;
                        Ok(out)
                    })
                    .collect::<Result<Vec<_>>>()?;
                concat_blocks(blocks, m.ncols()).map(Counts::Dense)
            }
            Counts::Sparse(m) => {
                if map.preserves_zeros() {
                    apply_sparse_stored(m, map, params).map(Counts::Sparse)
                } else {
                    let ranges = params.ranges(m.rows());
                    let blocks: Vec<Array2<f64>> = ranges
                        .par_iter()
                        .enumerate()
                        .map(|(index, rows)| {
                            let info = BlockInfo::new(index, rows);
                            let block = sparse_rows_to_dense(m, rows.clone());
                            let out = map.map_dense(info, block.view())?;
                            check_block_shape(info, m.cols(), &out)?;
                            Ok(out)
                        })
                        .collect::<Result<Vec<_>>>()?;
                    concat_blocks(blocks, m.cols()).map(Counts::Dense)
                }
            }
            Counts::Blocked(b) => {
                let mut sink = InMemoryBlocks::new(b.dim().1);
                self.apply_blockwise_into(map, params, &mut sink)?;
                Ok(Counts::Blocked(BlockedCounts::new(sink)))
            }
        }
    }

    /// Apply `map` block by block, handing each result to `sink` in order.
    pub fn apply_blockwise_into(
        &self,
        map: &dyn BlockMap,
        params: &BlockParams,
        sink: &mut dyn BlockSink,
    ) -> Result<()> {
        let n_samples = self.n_samples();
        let mut n_blocks = 0usize;
        self.visit_blocks(params, |info, block| {
            let out = map.map_dense(info, block)?;
            check_block_shape(info, n_samples, &out)?;
            n_blocks += 1;
            sink.write_block(info, out)
        })?;
        log::debug!("Transformed {} blocks", n_blocks);
        Ok(())
    }
}

fn check_block_shape(info: BlockInfo, n_samples: usize, out: &Array2<f64>) -> Result<()> {
    if out.dim() != (info.n_rows, n_samples) {
        return Err(TransformError::DimensionMismatch {
            expected: format!("{} x {} block", info.n_rows, n_samples),
            got: format!("{} x {} block", out.nrows(), out.ncols()),
        });
    }
    Ok(())
}

fn concat_blocks(blocks: Vec<Array2<f64>>, n_samples: usize) -> Result<Array2<f64>> {
    if blocks.is_empty() {
        return Ok(Array2::zeros((0, n_samples)));
    }
    let views: Vec<ArrayView2<'_, f64>> = blocks.iter().map(|b| b.view()).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| TransformError::DimensionMismatch {
        expected: format!("blocks with {} columns", n_samples),
        got: e.to_string(),
    })
}

/// Map only the stored entries of a CSR matrix, keeping its structure
fn apply_sparse_stored(m: &CsMat<f64>, map: &dyn BlockMap, params: &BlockParams) -> Result<CsMat<f64>> {
    let ranges = params.ranges(m.rows());
    let mapped: Vec<Vec<StoredEntry>> = ranges
        .par_iter()
        .enumerate()
        .map(|(index, rows)| {
            let info = BlockInfo::new(index, rows);
            let mut entries = Vec::new();
            for gene in rows.clone() {
                if let Some(row) = m.outer_view(gene) {
                    entries.extend(row.iter().map(|(sample, &value)| StoredEntry { gene, sample, value }));
                }
            }
            map.map_stored(info, &mut entries)?;
            Ok(entries)
        })
        .collect::<Result<Vec<_>>>()?;

    let nnz: usize = mapped.iter().map(|b| b.len()).sum();
    let mut indptr = vec![0usize; m.rows() + 1];
    let mut indices = Vec::with_capacity(nnz);
    let mut data = Vec::with_capacity(nnz);
    for entry in mapped.into_iter().flatten() {
        indptr[entry.gene + 1] += 1;
        indices.push(entry.sample);
        data.push(entry.value);
    }
    for gene in 0..m.rows() {
        indptr[gene + 1] += indptr[gene];
    }
    Ok(CsMat::new((m.rows(), m.cols()), indptr, indices, data))
}
