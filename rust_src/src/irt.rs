//! 3PL item response kernel.
//!
//! Response probability, Fisher and symmetric-KL item information, the
//! per-answer MAP step, full-history MLE and EAP estimators, and standard
//! errors from accumulated information.
//!
//! The scaling constant `D` inside the logistic argument defaults to 1.0 and
//! is applied the same way by every function here; callers that want the
//! normal-ogive approximation construct [`Irt3pl`] with 1.7 and pass it
//! everywhere.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ParameterError;
use crate::item::ItemParams;
use crate::utils::{
    EPSILON, VARIANCE_FLOOR, clamp_theta, clip_probability, compute_eap_with_se,
    log_normal_density, normalize_log_posterior, sigmoid, theta_grid, THETA_MAX, THETA_MIN,
};

pub const DEFAULT_SCALING: f64 = 1.0;

/// Quadrature points used by [`Irt3pl::eap_estimate`].
pub const EAP_QUAD_POINTS: usize = 81;

/// Step cap used inside the MLE iterations.
const MLE_STEP_CAP: f64 = 1.0;

/// One scored response in a history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredResponse {
    pub params: ItemParams,
    pub correct: bool,
}

impl ScoredResponse {
    pub fn new(params: ItemParams, correct: bool) -> Self {
        Self { params, correct }
    }
}

/// Result of an ability estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbilityEstimate {
    pub theta: f64,
    pub se: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// The 3PL model with its scaling constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Irt3pl {
    pub scaling: f64,
}

impl Default for Irt3pl {
    fn default() -> Self {
        Self {
            scaling: DEFAULT_SCALING,
        }
    }
}

impl Irt3pl {
    pub fn new(scaling: f64) -> Self {
        Self { scaling }
    }

    #[inline]
    fn logistic(&self, theta: f64, p: &ItemParams) -> f64 {
        sigmoid(self.scaling * p.a() * (theta - p.b()))
    }

    /// `P(θ) = c + (1 - c) σ(D a (θ - b))`
    #[inline]
    pub fn probability(&self, theta: f64, p: &ItemParams) -> f64 {
        let s = self.logistic(theta, p);
        p.c() + (1.0 - p.c()) * s
    }

    /// `dP/dθ`
    #[inline]
    pub fn derivative(&self, theta: f64, p: &ItemParams) -> f64 {
        let s = self.logistic(theta, p);
        self.scaling * p.a() * (1.0 - p.c()) * s * (1.0 - s)
    }

    /// Fisher information `(dP/dθ)² / (P(1-P))` with a floored denominator.
    #[inline]
    pub fn information(&self, theta: f64, p: &ItemParams) -> f64 {
        let prob = self.probability(theta, p);
        let d = self.derivative(theta, p);
        let denom = (prob * (1.0 - prob)).max(VARIANCE_FLOOR);
        (d * d / denom).max(0.0)
    }

    /// Symmetric KL divergence between the response distributions at θ and θ+δ.
    pub fn kl_information(&self, theta: f64, p: &ItemParams, delta: f64) -> f64 {
        let p1 = clip_probability(self.probability(theta, p));
        let p2 = clip_probability(self.probability(theta + delta, p));
        let kl = (p1 - p2) * ((p1 / p2).ln() - ((1.0 - p1) / (1.0 - p2)).ln());
        kl.max(0.0)
    }

    /// Total test information at θ.
    pub fn test_information<'a, I>(&self, theta: f64, items: I) -> f64
    where
        I: IntoIterator<Item = &'a ItemParams>,
    {
        items
            .into_iter()
            .map(|p| self.information(theta, p))
            .sum()
    }

    /// `1/√(ΣI(θ) + prior_precision)`, infinite when there is no information.
    pub fn standard_error<'a, I>(&self, theta: f64, items: I, prior_precision: f64) -> f64
    where
        I: IntoIterator<Item = &'a ItemParams>,
    {
        let total = self.test_information(theta, items) + prior_precision.max(0.0);
        if total > EPSILON {
            1.0 / total.sqrt()
        } else {
            f64::INFINITY
        }
    }

    /// One Fisher-scoring step on the log posterior for a single response.
    ///
    /// The step is clamped to `±step_cap` and the result to the ability
    /// bounds. A non-positive or non-finite `prior_sd` drops the prior term.
    #[allow(clippy::too_many_arguments)]
    pub fn one_step_map_update(
        &self,
        theta: f64,
        p: &ItemParams,
        correct: bool,
        prior_mean: f64,
        prior_sd: f64,
        step_cap: f64,
    ) -> f64 {
        let prior_precision = prior_precision(prior_sd);
        let prob = clip_probability(self.probability(theta, p));
        let d = self.derivative(theta, p);
        let pq = (prob * (1.0 - prob)).max(VARIANCE_FLOOR);
        let u = if correct { 1.0 } else { 0.0 };

        let gradient = (u - prob) * d / pq - (theta - prior_mean) * prior_precision;
        let curvature = d * d / pq + prior_precision;
        if curvature < EPSILON {
            return clamp_theta(theta);
        }

        let cap = step_cap.abs();
        let step = (gradient / curvature).clamp(-cap, cap);
        clamp_theta(theta + step)
    }

    /// Maximum-likelihood θ over a full response history, no prior.
    ///
    /// Hitting `max_iter` or a scale bound returns the last iterate with
    /// `converged = false`.
    pub fn mle_estimate(
        &self,
        history: &[ScoredResponse],
        initial_theta: f64,
        max_iter: usize,
        tol: f64,
    ) -> AbilityEstimate {
        let mut theta = clamp_theta(initial_theta);
        let mut converged = false;
        let mut iterations = 0;

        if history.is_empty() {
            return AbilityEstimate {
                theta,
                se: f64::INFINITY,
                iterations,
                converged,
            };
        }

        for iter in 0..max_iter {
            iterations = iter + 1;
            let mut gradient = 0.0;
            let mut info = 0.0;
            for r in history {
                let prob = clip_probability(self.probability(theta, &r.params));
                let d = self.derivative(theta, &r.params);
                let pq = (prob * (1.0 - prob)).max(VARIANCE_FLOOR);
                let u = if r.correct { 1.0 } else { 0.0 };
                gradient += (u - prob) * d / pq;
                info += d * d / pq;
            }

            if info < EPSILON {
                break;
            }

            let step = (gradient / info).clamp(-MLE_STEP_CAP, MLE_STEP_CAP);
            let next = clamp_theta(theta + step);

            let pinned = (next <= THETA_MIN && step < 0.0) || (next >= THETA_MAX && step > 0.0);
            if pinned && (next - theta).abs() < tol {
                theta = next;
                break;
            }

            let delta = next - theta;
            theta = next;
            if delta.abs() < tol {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                iterations,
                theta, "maximum-likelihood ability estimate did not converge"
            );
        }

        let se = self.standard_error(theta, history.iter().map(|r| &r.params), 0.0);
        AbilityEstimate {
            theta,
            se,
            iterations,
            converged,
        }
    }

    /// Expected-a-posteriori θ with a Gaussian prior, by quadrature on [-4, 4].
    ///
    /// `se` is the posterior standard deviation.
    pub fn eap_estimate(
        &self,
        history: &[ScoredResponse],
        prior_mean: f64,
        prior_sd: f64,
    ) -> AbilityEstimate {
        let nodes = theta_grid(THETA_MIN, THETA_MAX, EAP_QUAD_POINTS);
        let sd = if prior_sd.is_finite() && prior_sd > 0.0 {
            prior_sd
        } else {
            1.0
        };

        let log_posterior: Vec<f64> = nodes
            .iter()
            .map(|&theta| {
                let ll: f64 = history
                    .iter()
                    .map(|r| {
                        let prob = clip_probability(self.probability(theta, &r.params));
                        if r.correct {
                            prob.ln()
                        } else {
                            (1.0 - prob).ln()
                        }
                    })
                    .sum();
                ll + log_normal_density(theta, prior_mean, sd)
            })
            .collect();

        let posterior = normalize_log_posterior(&log_posterior);
        let (theta, se) = compute_eap_with_se(&posterior, &nodes);

        AbilityEstimate {
            theta,
            se,
            iterations: 1,
            converged: true,
        }
    }
}

/// Precision `1/sd²`, zero for a missing or degenerate prior.
#[inline]
pub fn prior_precision(prior_sd: f64) -> f64 {
    if prior_sd.is_finite() && prior_sd > 0.0 {
        1.0 / (prior_sd * prior_sd)
    } else {
        0.0
    }
}

/// 3PL response probability with the default scaling constant.
pub fn response_probability(theta: f64, a: f64, b: f64, c: f64) -> Result<f64, ParameterError> {
    let p = ItemParams::new(a, b, c)?;
    Ok(Irt3pl::default().probability(theta, &p))
}

/// Fisher item information with the default scaling constant.
pub fn item_information(theta: f64, a: f64, b: f64, c: f64) -> Result<f64, ParameterError> {
    let p = ItemParams::new(a, b, c)?;
    Ok(Irt3pl::default().information(theta, &p))
}

/// Symmetric-KL item information with the default scaling constant.
pub fn kl_information(
    theta: f64,
    a: f64,
    b: f64,
    c: f64,
    delta: f64,
) -> Result<f64, ParameterError> {
    let p = ItemParams::new(a, b, c)?;
    Ok(Irt3pl::default().kl_information(theta, &p, delta))
}

#[allow(clippy::too_many_arguments)]
pub fn one_step_map_update(
    theta: f64,
    a: f64,
    b: f64,
    c: f64,
    correct: bool,
    prior_mean: f64,
    prior_sd: f64,
    step_cap: f64,
) -> Result<f64, ParameterError> {
    let p = ItemParams::new(a, b, c)?;
    Ok(Irt3pl::default().one_step_map_update(theta, &p, correct, prior_mean, prior_sd, step_cap))
}

pub fn mle_estimate(
    history: &[ScoredResponse],
    initial_theta: f64,
    max_iter: usize,
    tol: f64,
) -> AbilityEstimate {
    Irt3pl::default().mle_estimate(history, initial_theta, max_iter, tol)
}

pub fn eap_estimate(history: &[ScoredResponse], prior_mean: f64, prior_sd: f64) -> AbilityEstimate {
    Irt3pl::default().eap_estimate(history, prior_mean, prior_sd)
}

pub fn standard_error(theta: f64, items: &[ItemParams], prior_precision: f64) -> f64 {
    Irt3pl::default().standard_error(theta, items, prior_precision)
}
