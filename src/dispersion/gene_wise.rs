//! Gene-wise overdispersion estimates with the means held fixed

use ndarray::ArrayView1;

use super::DispersionParams;
use crate::glm::nb_log_likelihood;

/// Method-of-moments starting value
///
/// (var - xim * mean) / mean^2 on size-factor normalized counts, where xim is
/// the mean of 1 / size factor. Floored at zero; zero for a single sample or
/// an all-zero gene.
pub fn moments_overdispersion(counts: ArrayView1<'_, f64>, size_factors: ArrayView1<'_, f64>) -> f64 {
    let n = counts.len();
    if n < 2 {
        return 0.0;
    }
    let normalized: Vec<f64> = counts
        .iter()
        .zip(size_factors.iter())
        .map(|(&y, &s)| y / s)
        .collect();
    let mean = normalized.iter().sum::<f64>() / n as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let var = normalized.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let xim = size_factors.iter().map(|&s| 1.0 / s).sum::<f64>() / n as f64;
    ((var - xim * mean) / (mean * mean)).max(0.0)
}

fn log_likelihood(counts: ArrayView1<'_, f64>, mu: ArrayView1<'_, f64>, alpha: f64) -> f64 {
    counts
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| nb_log_likelihood(y, m, alpha))
        .sum()
}

/// Maximum likelihood overdispersion for one gene given its fitted means
///
/// Returns 0 when the data show no extra-Poisson variation, i.e. the score
/// at the Poisson limit, sum((y - mu)^2 - y) / 2, is not positive. Otherwise
/// a coarse log-scale grid brackets the maximum, which golden-section search
/// then refines.
pub fn overdispersion_mle(
    counts: ArrayView1<'_, f64>,
    mu: ArrayView1<'_, f64>,
    params: &DispersionParams,
) -> f64 {
    if counts.iter().all(|&y| y == 0.0) {
        return 0.0;
    }
    let poisson_score: f64 = counts
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| (y - m).powi(2) - y)
        .sum::<f64>()
        / 2.0;
    if poisson_score <= 0.0 {
        return 0.0;
    }

    let objective = |log_alpha: f64| log_likelihood(counts, mu, log_alpha.exp());

    let lower = params.min_overdispersion.ln();
    let upper = params.max_overdispersion.ln();
    let n_grid = params.grid_points.max(3);
    let delta = (upper - lower) / (n_grid - 1) as f64;

    let best = (0..n_grid)
        .map(|i| {
            let x = lower + i as f64 * delta;
            (x, objective(x))
        })
        .filter(|(_, lp)| lp.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let Some((best_x, _)) = best else {
        log::debug!("Overdispersion likelihood not finite on the grid, using the lower bound");
        return params.min_overdispersion;
    };

    let refined = golden_section_max(
        objective,
        (best_x - delta).max(lower),
        (best_x + delta).min(upper),
        params.tol,
        params.maxit,
    );
    refined.exp().clamp(params.min_overdispersion, params.max_overdispersion)
}

/// Maximize a unimodal function on [a, b]
fn golden_section_max<F: Fn(f64) -> f64>(f: F, mut a: f64, mut b: f64, tol: f64, maxit: usize) -> f64 {
    let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..maxit {
        if (b - a).abs() < tol {
            break;
        }
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}
