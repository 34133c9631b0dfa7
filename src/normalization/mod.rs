//! Per-sample size factors for count normalization

mod size_factors;

pub use size_factors::{resolve_size_factors, SizeFactorMethod, SizeFactorSpec};
