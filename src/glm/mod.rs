//! Gamma-Poisson generalized linear models: designs, fitting and residuals

mod design;
mod fitting;
mod model;
mod negative_binomial;
mod residuals;

pub use design::{check_full_rank, DesignMatrix, LOG_DEPTH_COLUMN};
pub use fitting::{fit_single_gene, GeneFit, GlmFitParams, IrlsFitter, MAX_BETA};
pub use model::{FitOverdispersion, FitRequest, GammaPoissonFit, ModelFitter, RidgePenalty};
pub use negative_binomial::{nb_cdf, nb_log_likelihood, nb_mean, nb_unit_deviance, nb_variance, nb_weight};
pub use residuals::{
    deviance_residual, pearson_residual, quantile_residual, randomized_quantile_residual, residuals_block,
    working_residual, ResidualKind,
};
