//! Row-block access to count matrices
//!
//! Every transform in this crate is expressed as a [`BlockMap`]: a function
//! from one block of genes (rows) to a block of transformed values of the same
//! shape. Block-backed matrices are read through a [`BlockStore`] and written
//! through a [`BlockSink`], so only one block is resident at a time.

use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};

/// Default number of genes per block for in-memory inputs
pub const DEFAULT_BLOCK_ROWS: usize = 1000;

/// Block partitioning for in-memory inputs.
///
/// Block-backed inputs keep the partitioning of their store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockParams {
    /// Number of genes per block
    pub block_rows: usize,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            block_rows: DEFAULT_BLOCK_ROWS,
        }
    }
}

impl BlockParams {
    /// Split `n_genes` rows into consecutive ranges of at most `block_rows`
    pub fn ranges(&self, n_genes: usize) -> Vec<Range<usize>> {
        let step = self.block_rows.max(1);
        (0..n_genes)
            .step_by(step)
            .map(|start| start..(start + step).min(n_genes))
            .collect()
    }
}

/// Position of a block within the full matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Zero-based block index
    pub index: usize,
    /// Gene index of the first row in the block
    pub row_offset: usize,
    /// Number of rows in the block
    pub n_rows: usize,
}

impl BlockInfo {
    pub fn new(index: usize, rows: &Range<usize>) -> Self {
        Self {
            index,
            row_offset: rows.start,
            n_rows: rows.len(),
        }
    }

    /// Row range covered by the block, in full-matrix coordinates
    pub fn rows(&self) -> Range<usize> {
        self.row_offset..self.row_offset + self.n_rows
    }
}

/// One stored (structurally non-zero) entry of a sparse matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredEntry {
    pub gene: usize,
    pub sample: usize,
    pub value: f64,
}

/// A transformation applied one row block at a time.
pub trait BlockMap: Sync {
    /// Whether every zero input entry maps to exactly zero.
    ///
    /// When true, sparse inputs are transformed through [`BlockMap::map_stored`]
    /// and keep their sparsity pattern.
    fn preserves_zeros(&self) -> bool {
        false
    }

    /// Transform a dense block. The result must have the shape of `block`.
    fn map_dense(&self, info: BlockInfo, block: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Transform the stored entries of a sparse block in place.
    fn map_stored(&self, info: BlockInfo, entries: &mut [StoredEntry]) -> Result<()> {
        let _ = entries;
        Err(TransformError::InvalidInput {
            reason: format!(
                "block {} cannot be transformed entry-wise on sparse storage",
                info.index
            ),
        })
    }
}

/// Read access to a matrix kept in row blocks (possibly out of core)
pub trait BlockStore: Send + Sync {
    /// (genes, samples)
    fn dim(&self) -> (usize, usize);

    fn n_blocks(&self) -> usize;

    /// Gene range of block `index`
    fn block_range(&self, index: usize) -> Range<usize>;

    /// Materialize block `index` as a dense (rows x samples) array
    fn read_block(&self, index: usize) -> Result<Array2<f64>>;
}

/// Destination for transformed blocks, written in block order
pub trait BlockSink {
    fn write_block(&mut self, info: BlockInfo, block: Array2<f64>) -> Result<()>;
}

/// Blocks held in memory. Serves both as a store and as a sink.
#[derive(Debug, Clone)]
pub struct InMemoryBlocks {
    n_samples: usize,
    row_starts: Vec<usize>,
    blocks: Vec<Array2<f64>>,
}

impl InMemoryBlocks {
    /// Empty collection expecting blocks with `n_samples` columns
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            row_starts: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Split a dense matrix into row blocks
    pub fn from_dense(matrix: &Array2<f64>, params: &BlockParams) -> Self {
        let mut store = Self::new(matrix.ncols());
        for rows in params.ranges(matrix.nrows()) {
            store.row_starts.push(rows.start);
            store
                .blocks
                .push(matrix.slice(ndarray::s![rows, ..]).to_owned());
        }
        store
    }

    fn n_genes(&self) -> usize {
        self.blocks.iter().map(|b| b.nrows()).sum()
    }

    /// Concatenate all blocks into one dense matrix
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        if self.blocks.is_empty() {
            return Ok(Array2::zeros((0, self.n_samples)));
        }
        let views: Vec<ArrayView2<'_, f64>> = self.blocks.iter().map(|b| b.view()).collect();
        ndarray::concatenate(Axis(0), &views).map_err(|e| TransformError::DimensionMismatch {
            expected: format!("blocks with {} columns", self.n_samples),
            got: e.to_string(),
        })
    }
}

impl BlockStore for InMemoryBlocks {
    fn dim(&self) -> (usize, usize) {
        (self.n_genes(), self.n_samples)
    }

    fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block_range(&self, index: usize) -> Range<usize> {
        let start = self.row_starts[index];
        start..start + self.blocks[index].nrows()
    }

    fn read_block(&self, index: usize) -> Result<Array2<f64>> {
        self.blocks
            .get(index)
            .cloned()
            .ok_or_else(|| TransformError::InvalidInput {
                reason: format!("block {} out of range ({} blocks)", index, self.blocks.len()),
            })
    }
}

impl BlockSink for InMemoryBlocks {
    fn write_block(&mut self, info: BlockInfo, block: Array2<f64>) -> Result<()> {
        if info.index != self.blocks.len() {
            return Err(TransformError::InvalidInput {
                reason: format!(
                    "blocks must be written in order: expected block {}, got {}",
                    self.blocks.len(),
                    info.index
                ),
            });
        }
        if block.ncols() != self.n_samples || block.nrows() != info.n_rows {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} x {} block", info.n_rows, self.n_samples),
                got: format!("{} x {} block", block.nrows(), block.ncols()),
            });
        }
        self.row_starts.push(info.row_offset);
        self.blocks.push(block);
        Ok(())
    }
}

/// A count matrix accessed block by block through a shared [`BlockStore`]
#[derive(Clone)]
pub struct BlockedCounts {
    store: Arc<dyn BlockStore>,
}

impl std::fmt::Debug for BlockedCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockedCounts")
            .field("dim", &self.store.dim())
            .field("n_blocks", &self.store.n_blocks())
            .finish()
    }
}

impl BlockedCounts {
    pub fn new<S: BlockStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.store.dim()
    }

    pub fn n_blocks(&self) -> usize {
        self.store.n_blocks()
    }

    pub fn block_info(&self, index: usize) -> BlockInfo {
        BlockInfo::new(index, &self.store.block_range(index))
    }

    /// Read one block, checking only its shape
    pub fn read_values(&self, index: usize) -> Result<Array2<f64>> {
        let block = self.store.read_block(index)?;
        let info = self.block_info(index);
        let (_, n_samples) = self.dim();
        if block.nrows() != info.n_rows || block.ncols() != n_samples {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} x {} block", info.n_rows, n_samples),
                got: format!("{} x {} block", block.nrows(), block.ncols()),
            });
        }
        Ok(block)
    }

    /// Read one block and check it holds valid counts
    pub fn read_block(&self, index: usize) -> Result<Array2<f64>> {
        let block = self.read_values(index)?;
        super::adapter::check_count_values(block.iter())?;
        Ok(block)
    }

    /// Materialize every block into one dense count matrix
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        self.assemble(Self::read_block)
    }

    /// Materialize every block without the count checks (for transformed values)
    pub fn values_to_dense(&self) -> Result<Array2<f64>> {
        self.assemble(Self::read_values)
    }

    fn assemble(&self, read: fn(&Self, usize) -> Result<Array2<f64>>) -> Result<Array2<f64>> {
        let (n_genes, n_samples) = self.dim();
        let mut dense = Array2::zeros((n_genes, n_samples));
        for index in 0..self.n_blocks() {
            let info = self.block_info(index);
            let block = read(self, index)?;
            dense.slice_mut(ndarray::s![info.rows(), ..]).assign(&block);
        }
        Ok(dense)
    }
}
