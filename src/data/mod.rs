//! Count data access: input normalization, block-wise application and labels

mod adapter;
mod blocks;
mod count_matrix;
mod metadata;

pub use adapter::{normalize, restore, Counts, InputData, TransformedData};
pub use blocks::{
    BlockInfo, BlockMap, BlockParams, BlockSink, BlockStore, BlockedCounts, InMemoryBlocks, StoredEntry,
    DEFAULT_BLOCK_ROWS,
};
pub use count_matrix::CountMatrix;
pub use metadata::SampleMetadata;
