//! Delimited file input and output

mod blocks;
mod delimited;

pub use blocks::{DelimitedBlockFile, DelimitedBlockWriter};
pub use delimited::{read_count_matrix, read_metadata, write_transformed};
