//! Shared numeric helpers for the IRT kernel and calibration code.

use ndarray::{Array1, Array2};

pub const LOG_2_PI: f64 = 1.8378770664093453;
pub const EPSILON: f64 = 1e-10;

/// Floor applied to `P(1-P)` before dividing by it.
pub const VARIANCE_FLOOR: f64 = 1e-8;

/// Ability scale bounds.
pub const THETA_MIN: f64 = -4.0;
pub const THETA_MAX: f64 = 4.0;

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn clip(x: f64, min: f64, max: f64) -> f64 {
    x.max(min).min(max)
}

#[inline]
pub fn clip_probability(p: f64) -> f64 {
    clip(p, EPSILON, 1.0 - EPSILON)
}

#[inline]
pub fn clamp_theta(theta: f64) -> f64 {
    if theta.is_nan() {
        return 0.0;
    }
    clip(theta, THETA_MIN, THETA_MAX)
}

/// Standard normal CDF approximation (Abramowitz-Stegun 26.2.17).
pub fn normal_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let d = 0.3989423 * (-x * x / 2.0).exp();
    let p =
        d * t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274))));
    if x > 0.0 { 1.0 - p } else { p }
}

/// Log density of N(mean, sd²) at `x`.
#[inline]
pub fn log_normal_density(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * LOG_2_PI - sd.ln() - 0.5 * z * z
}

/// Equally spaced grid over `[lo, hi]`.
pub fn theta_grid(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![(lo + hi) / 2.0];
    }
    let step = (hi - lo) / (n - 1) as f64;
    (0..n).map(|i| lo + i as f64 * step).collect()
}

/// Turn unnormalized log posterior values into probabilities summing to one.
pub fn normalize_log_posterior(log_posterior: &[f64]) -> Vec<f64> {
    let log_norm = logsumexp(log_posterior);
    if !log_norm.is_finite() {
        let n = log_posterior.len().max(1);
        return vec![1.0 / n as f64; log_posterior.len()];
    }
    log_posterior
        .iter()
        .map(|&lp| (lp - log_norm).exp())
        .collect()
}

/// Posterior mean and posterior standard deviation over quadrature nodes.
pub fn compute_eap_with_se(posterior: &[f64], nodes: &[f64]) -> (f64, f64) {
    let eap: f64 = posterior
        .iter()
        .zip(nodes.iter())
        .map(|(&p, &theta)| p * theta)
        .sum();

    let psd: f64 = posterior
        .iter()
        .zip(nodes.iter())
        .map(|(&p, &theta)| p * (theta - eap).powi(2))
        .sum::<f64>()
        .sqrt();

    (eap, psd)
}

/// Empirical quantile with linear interpolation; `sorted` must be ascending.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = clip(q, 0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Gaussian elimination with partial pivoting. `None` when singular.
pub fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    let mut aug = Array2::<f64>::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n]] = b[i];
    }

    for i in 0..n {
        let mut max_row = i;
        for k in (i + 1)..n {
            if aug[[k, i]].abs() > aug[[max_row, i]].abs() {
                max_row = k;
            }
        }

        for j in 0..=n {
            aug.swap([i, j], [max_row, j]);
        }

        if aug[[i, i]].abs() < 1e-12 {
            return None;
        }

        for k in (i + 1)..n {
            let factor = aug[[k, i]] / aug[[i, i]];
            for j in i..=n {
                aug[[k, j]] -= factor * aug[[i, j]];
            }
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = aug[[i, n]];
        for j in (i + 1)..n {
            sum -= aug[[i, j]] * x[j];
        }
        x[i] = sum / aug[[i, i]];
    }

    Some(x)
}

/// Matrix inverse via column-wise solves.
pub fn invert_matrix(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        let mut e = Array1::<f64>::zeros(n);
        e[col] = 1.0;
        let x = solve_linear_system(a, &e)?;
        for row in 0..n {
            inv[[row, col]] = x[row];
        }
    }
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sigmoid_is_symmetric_and_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!((sigmoid(3.0) + sigmoid(-3.0) - 1.0).abs() < 1e-12);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(sigmoid(800.0) <= 1.0);
    }

    #[test]
    fn logsumexp_handles_large_values() {
        let v = logsumexp(&[1000.0, 1000.0]);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn normal_cdf_matches_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn eap_of_symmetric_posterior_is_centered() {
        let nodes = theta_grid(-4.0, 4.0, 81);
        let log_post: Vec<f64> = nodes.iter().map(|t| -0.5 * t * t).collect();
        let post = normalize_log_posterior(&log_post);
        let (eap, psd) = compute_eap_with_se(&post, &nodes);
        assert!(eap.abs() < 1e-9);
        assert!((psd - 1.0).abs() < 0.05);
    }

    #[test]
    fn solves_small_system() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = solve_linear_system(&a, &b).unwrap();
        assert!((x[0] - 0.1).abs() < 1e-12);
        assert!((x[1] - 0.6).abs() < 1e-12);

        let inv = invert_matrix(&a).unwrap();
        let ident = a.dot(&inv);
        assert!((ident[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(ident[[0, 1]].abs() < 1e-12);
    }

    #[test]
    fn singular_system_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(solve_linear_system(&a, &array![1.0, 1.0]).is_none());
    }

    #[test]
    fn quantile_interpolates() {
        let v = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(quantile(&v, 0.0), 0.0);
        assert_eq!(quantile(&v, 1.0), 3.0);
        assert!((quantile(&v, 0.5) - 1.5).abs() < 1e-12);
    }
}
