//! Command-line interface for gampoi_transform

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};

use crate::data::{BlockParams, DEFAULT_BLOCK_ROWS};
use crate::dispersion::{Overdispersion, OverdispersionSpec};
use crate::error::{Result, TransformError};
use crate::glm::{DesignMatrix, ResidualKind};
use crate::normalization::{SizeFactorMethod, SizeFactorSpec};
use crate::rng::DEFAULT_SEED;
use crate::transform::{Clipping, DeltaParams, ResidualParams, DEFAULT_MINIMUM_OVERDISPERSION};

#[derive(Parser, Debug)]
#[command(name = "gampoi_transform")]
#[command(version)]
#[command(about = "Variance-stabilizing transformations for Gamma-Poisson count matrices")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// acosh(2 alpha x + 1) / sqrt(alpha) of the size-factor normalized counts
    #[command(after_long_help = "\
Examples:
  gampoi_transform acosh -c counts.tsv -o acosh.tsv
  gampoi_transform acosh -c counts.tsv -o acosh.tsv --overdispersion estimate
  gampoi_transform acosh -c big.tsv -o acosh.tsv --streaming --block-rows 5000")]
    Acosh(DeltaArgs),

    /// log(4 alpha x + 1) / sqrt(alpha) of the size-factor normalized counts
    #[command(after_long_help = "\
Examples:
  gampoi_transform shifted-log -c counts.tsv -o log.tsv
  gampoi_transform shifted-log -c counts.tsv -o log.tsv --pseudo-count 1")]
    ShiftedLog(DeltaArgs),

    /// Residuals of a per-gene Gamma-Poisson GLM
    #[command(after_long_help = "\
Examples:
  gampoi_transform residuals -c counts.tsv -o rqr.tsv --seed 1
  gampoi_transform residuals -c counts.tsv -o pearson.tsv --residual-type pearson --clipping sqrt
  gampoi_transform residuals -c counts.tsv -m samples.tsv -d condition -o rqr.tsv \\
    --shrinkage --fit-output fit.json")]
    Residuals(ResidualArgs),
}

/// Input, output and block handling shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Count matrix (tab or comma separated, gene ids in the first column)
    #[arg(short, long)]
    pub counts: PathBuf,

    /// Output file (tab separated)
    #[arg(short, long)]
    pub output: PathBuf,

    /// Size factors: normed_sum, ratio, poscounts or none
    #[arg(long, default_value = "normed_sum")]
    pub size_factors: String,

    /// Genes per block
    #[arg(long, default_value_t = DEFAULT_BLOCK_ROWS)]
    pub block_rows: usize,

    /// Read and write the matrix one block at a time instead of loading it
    #[arg(long)]
    pub streaming: bool,
}

impl InputArgs {
    pub fn block(&self) -> BlockParams {
        BlockParams {
            block_rows: self.block_rows,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeltaArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Overdispersion: a number, "estimate" or "poisson"
    #[arg(long, default_value = "0.05")]
    pub overdispersion: String,

    /// Pseudo-count c, used as overdispersion 1 / (4c)
    #[arg(long)]
    pub pseudo_count: Option<f64>,

    /// Smallest overdispersion used by the shifted logarithm
    #[arg(long, default_value_t = DEFAULT_MINIMUM_OVERDISPERSION)]
    pub minimum_overdispersion: f64,
}

impl DeltaArgs {
    pub fn params(&self) -> Result<DeltaParams> {
        Ok(DeltaParams {
            overdispersion: self.overdispersion.parse()?,
            size_factors: parse_size_factors(&self.input.size_factors)?,
            pseudo_count: self.pseudo_count.map(Overdispersion::Scalar),
            minimum_overdispersion: self.minimum_overdispersion,
            block: self.input.block(),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ResidualArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// pearson, randomized_quantile, deviance, working, response or quantile
    #[arg(long, default_value = "randomized_quantile")]
    pub residual_type: String,

    /// Overdispersion: "estimate", a number or "poisson"
    #[arg(long, default_value = "estimate")]
    pub overdispersion: String,

    /// Sample metadata (first column sample ids)
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,

    /// Metadata column used as a categorical design variable
    #[arg(short, long, requires = "metadata")]
    pub design: Option<String>,

    /// Model sequencing depth as a covariate instead of an offset
    #[arg(long)]
    pub no_offset_model: bool,

    /// Ridge penalty on the non-intercept coefficients
    #[arg(long)]
    pub ridge_penalty: Option<f64>,

    /// Shrink overdispersions toward their mean trend
    #[arg(long)]
    pub shrinkage: bool,

    /// Clip residuals to ±sqrt(samples) ("sqrt") or ±value
    #[arg(long)]
    pub clipping: Option<String>,

    /// Seed for randomized quantile residuals
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Write the fitted model as JSON
    #[arg(long)]
    pub fit_output: Option<PathBuf>,
}

impl ResidualArgs {
    pub fn params(&self, design: Option<DesignMatrix>) -> Result<ResidualParams> {
        Ok(ResidualParams {
            kind: ResidualKind::from_str(&self.residual_type)?,
            design,
            offset_model: !self.no_offset_model,
            ridge_penalty: self.ridge_penalty,
            overdispersion: parse_residual_overdispersion(&self.overdispersion)?,
            overdispersion_shrinkage: self.shrinkage,
            size_factors: parse_size_factors(&self.input.size_factors)?,
            clipping: self.clipping.as_deref().map_or(Ok(Clipping::None), parse_clipping)?,
            return_fit: self.fit_output.is_some(),
            block: self.input.block(),
        })
    }
}

/// "none" means no normalization; anything else names a method
pub fn parse_size_factors(s: &str) -> Result<SizeFactorSpec> {
    match s.trim().to_lowercase().as_str() {
        "none" | "false" => Ok(SizeFactorSpec::Unit),
        other => SizeFactorMethod::from_str(other).map(SizeFactorSpec::Auto),
    }
}

pub fn parse_clipping(s: &str) -> Result<Clipping> {
    match s.trim().to_lowercase().as_str() {
        "sqrt" | "true" => Ok(Clipping::SqrtSamples),
        "none" | "false" => Ok(Clipping::None),
        other => other
            .parse::<f64>()
            .map(Clipping::Value)
            .map_err(|_| TransformError::InvalidInput {
                reason: format!("cannot interpret '{}' as a clipping bound", s),
            }),
    }
}

/// Residuals cannot take overdispersions from a model on the command line
fn parse_residual_overdispersion(s: &str) -> Result<OverdispersionSpec> {
    match OverdispersionSpec::from_str(s)? {
        OverdispersionSpec::FromModel => Err(TransformError::InvalidInput {
            reason: "--overdispersion model is not available for residuals".to_string(),
        }),
        spec => Ok(spec),
    }
}
