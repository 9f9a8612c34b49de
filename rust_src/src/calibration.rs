//! Per-window re-estimation of item parameters given person abilities.
//!
//! The Laplace calibrator finds the posterior mode of (a, b, c) by Fisher
//! scoring and reads 95% intervals off the inverse posterior precision. The
//! Metropolis calibrator samples the same posterior with a random walk.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_distr::Normal;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dif::DifResult;
use crate::drift::Severity;
use crate::error::{CatError, Result};
use crate::irt::Irt3pl;
use crate::item::{Item, ItemId, ItemParams};
use crate::utils::{
    EPSILON, clip_probability, invert_matrix, log_normal_density, quantile, sigmoid,
    solve_linear_system,
};

const Z_95: f64 = 1.959_963_984_540_054;

const A_BOUNDS: (f64, f64) = (0.05, 6.0);
const B_BOUNDS: (f64, f64) = (-6.0, 6.0);
const C_BOUNDS: (f64, f64) = (0.0, 0.5);

/// Point estimate with a 95% interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamEstimate {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ParamEstimate {
    pub fn new(value: f64, lower: f64, upper: f64) -> Self {
        Self { value, lower, upper }
    }

    /// Symmetric normal interval.
    pub fn from_se(value: f64, se: f64) -> Self {
        Self::new(value, value - Z_95 * se, value + Z_95 * se)
    }

    /// Same centre, interval scaled by `factor`.
    pub fn widened(&self, factor: f64) -> Self {
        Self::new(
            self.value,
            self.value - (self.value - self.lower) * factor,
            self.value + (self.upper - self.value) * factor,
        )
    }

    pub fn contains(&self, x: f64) -> bool {
        self.lower <= x && x <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Prior standard deviations around the bank parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamPrior {
    /// Anchors hold the scale in place.
    pub anchor_sd: f64,
    pub free_sd: f64,
    /// Multiplier applied to the sd for `c`.
    pub c_sd_scale: f64,
}

impl Default for ParamPrior {
    fn default() -> Self {
        Self {
            anchor_sd: 0.05,
            free_sd: 1.0,
            c_sd_scale: 0.1,
        }
    }
}

impl ParamPrior {
    /// Prior sds for (a, b, c).
    pub fn sds(&self, anchor: bool) -> [f64; 3] {
        let sd = if anchor { self.anchor_sd } else { self.free_sd };
        [sd, sd, sd * self.c_sd_scale]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("anchor_sd", self.anchor_sd),
            ("free_sd", self.free_sd),
            ("c_sd_scale", self.c_sd_scale),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(CatError::Config(format!("prior {name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Estimates of one item over one window. Stored once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCalibration {
    pub item_id: ItemId,
    pub window_id: String,
    pub a: ParamEstimate,
    pub b: ParamEstimate,
    pub c: ParamEstimate,
    pub n: usize,
    pub converged: bool,
    /// Too few responses: baseline carried forward with widened intervals.
    pub degraded: bool,
    #[serde(default)]
    pub dif: Vec<DifResult>,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub created_at: DateTime<Utc>,
}

impl ItemCalibration {
    /// Baseline taken from the bank parameters with prior-width intervals.
    pub fn from_bank(
        item: &Item,
        window_id: impl Into<String>,
        prior: &ParamPrior,
        now: DateTime<Utc>,
    ) -> Self {
        let [sa, sb, sc] = prior.sds(item.anchor);
        Self {
            item_id: item.id.clone(),
            window_id: window_id.into(),
            a: ParamEstimate::from_se(item.params.a(), sa),
            b: ParamEstimate::from_se(item.params.b(), sb),
            c: ParamEstimate::from_se(item.params.c(), sc),
            n: 0,
            converged: true,
            degraded: false,
            dif: Vec::new(),
            severity: None,
            created_at: now,
        }
    }

    /// Baseline carried into `window_id` with intervals doubled.
    pub fn degraded_from(
        baseline: &ItemCalibration,
        window_id: impl Into<String>,
        n: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: baseline.item_id.clone(),
            window_id: window_id.into(),
            a: baseline.a.widened(2.0),
            b: baseline.b.widened(2.0),
            c: baseline.c.widened(2.0),
            n,
            converged: false,
            degraded: true,
            dif: Vec::new(),
            severity: None,
            created_at: now,
        }
    }

    pub fn from_fit(
        item_id: impl Into<ItemId>,
        window_id: impl Into<String>,
        fit: &ParamFit,
        n: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            window_id: window_id.into(),
            a: fit.a,
            b: fit.b,
            c: fit.c,
            n,
            converged: fit.converged,
            degraded: false,
            dif: Vec::new(),
            severity: None,
            created_at: now,
        }
    }

    /// Point estimates as kernel parameters.
    pub fn params(&self) -> Result<ItemParams> {
        ItemParams::new(self.a.value, self.b.value, self.c.value).map_err(|source| {
            CatError::Parameter {
                item_id: self.item_id.clone(),
                source,
            }
        })
    }
}

/// Output of a [`Calibrator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamFit {
    pub a: ParamEstimate,
    pub b: ParamEstimate,
    pub c: ParamEstimate,
    pub iterations: usize,
    pub converged: bool,
}

pub trait Calibrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Posterior summary of `item`'s parameters given `(θ, correct)` pairs.
    fn calibrate(&self, item: &Item, data: &[(f64, bool)], prior: &ParamPrior)
    -> Result<ParamFit>;
}

fn clamp_params(x: [f64; 3]) -> [f64; 3] {
    [
        x[0].clamp(A_BOUNDS.0, A_BOUNDS.1),
        x[1].clamp(B_BOUNDS.0, B_BOUNDS.1),
        x[2].clamp(C_BOUNDS.0, C_BOUNDS.1),
    ]
}

fn in_bounds(x: &[f64; 3]) -> bool {
    (A_BOUNDS.0..=A_BOUNDS.1).contains(&x[0])
        && (B_BOUNDS.0..=B_BOUNDS.1).contains(&x[1])
        && (C_BOUNDS.0..=C_BOUNDS.1).contains(&x[2])
}

fn centre(item: &Item) -> [f64; 3] {
    clamp_params([item.params.a(), item.params.b(), item.params.c()])
}

fn log_likelihood(model: &Irt3pl, x: &[f64; 3], data: &[(f64, bool)]) -> f64 {
    data.iter()
        .map(|&(theta, u)| {
            let s = sigmoid(model.scaling * x[0] * (theta - x[1]));
            let p = clip_probability(x[2] + (1.0 - x[2]) * s);
            if u { p.ln() } else { (1.0 - p).ln() }
        })
        .sum()
}

fn log_prior(x: &[f64; 3], mu: &[f64; 3], sd: &[f64; 3]) -> f64 {
    (0..3).map(|k| log_normal_density(x[k], mu[k], sd[k])).sum()
}

/// Deterministic MAP + Laplace approximation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaplaceCalibrator {
    pub model: Irt3pl,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for LaplaceCalibrator {
    fn default() -> Self {
        Self {
            model: Irt3pl::default(),
            max_iter: 100,
            tol: 1e-5,
        }
    }
}

impl LaplaceCalibrator {
    pub fn new(model: Irt3pl, max_iter: usize, tol: f64) -> Self {
        Self {
            model,
            max_iter,
            tol,
        }
    }

    /// Likelihood gradient and expected information at `x`.
    fn score_and_information(&self, x: &[f64; 3], data: &[(f64, bool)]) -> (Array1<f64>, Array2<f64>) {
        let d = self.model.scaling;
        let mut grad = Array1::<f64>::zeros(3);
        let mut info = Array2::<f64>::zeros((3, 3));

        for &(theta, u) in data {
            let s = sigmoid(d * x[0] * (theta - x[1]));
            let p = clip_probability(x[2] + (1.0 - x[2]) * s);
            let slope = (1.0 - x[2]) * s * (1.0 - s);
            let dp = [slope * d * (theta - x[1]), -slope * d * x[0], 1.0 - s];
            let pq = (p * (1.0 - p)).max(EPSILON);
            let resid = (if u { 1.0 } else { 0.0 }) - p;

            for k in 0..3 {
                grad[k] += resid * dp[k] / pq;
                for l in 0..3 {
                    info[[k, l]] += dp[k] * dp[l] / pq;
                }
            }
        }
        (grad, info)
    }
}

impl Calibrator for LaplaceCalibrator {
    fn name(&self) -> &'static str {
        "laplace"
    }

    fn calibrate(
        &self,
        item: &Item,
        data: &[(f64, bool)],
        prior: &ParamPrior,
    ) -> Result<ParamFit> {
        let mu = centre(item);
        let sd = prior.sds(item.anchor);
        let precision: [f64; 3] = [1.0 / (sd[0] * sd[0]), 1.0 / (sd[1] * sd[1]), 1.0 / (sd[2] * sd[2])];

        let singular = || CatError::Calibration {
            item_id: item.id.clone(),
            reason: "posterior precision is singular".into(),
        };

        let mut x = mu;
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..self.max_iter {
            iterations = iter + 1;
            let (mut grad, mut hess) = self.score_and_information(&x, data);
            for k in 0..3 {
                grad[k] -= precision[k] * (x[k] - mu[k]);
                hess[[k, k]] += precision[k];
            }

            let delta = solve_linear_system(&hess, &grad).ok_or_else(singular)?;
            let largest = delta.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if !largest.is_finite() {
                return Err(CatError::Calibration {
                    item_id: item.id.clone(),
                    reason: "non-finite scoring step".into(),
                });
            }
            let scale = if largest > 1.0 { 1.0 / largest } else { 1.0 };

            x = clamp_params([
                x[0] + scale * delta[0],
                x[1] + scale * delta[1],
                x[2] + scale * delta[2],
            ]);

            if largest < self.tol {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(item_id = %item.id, iterations, "calibration did not converge");
        }

        let (_, mut hess) = self.score_and_information(&x, data);
        for k in 0..3 {
            hess[[k, k]] += precision[k];
        }
        let cov = invert_matrix(&hess).ok_or_else(singular)?;
        let se = |k: usize| {
            let v = cov[[k, k]];
            if v.is_finite() && v > 0.0 { v.sqrt() } else { sd[k] }
        };

        Ok(ParamFit {
            a: ParamEstimate::from_se(x[0], se(0)),
            b: ParamEstimate::from_se(x[1], se(1)),
            c: ParamEstimate::from_se(x[2], se(2)),
            iterations,
            converged,
        })
    }
}

/// Random-walk Metropolis over (a, b, c), one component at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetropolisCalibrator {
    pub model: Irt3pl,
    pub samples: usize,
    pub burn_in: usize,
    /// Proposal sd for a and b; c uses a tenth of it.
    pub proposal_sd: f64,
    pub seed: u64,
}

impl Default for MetropolisCalibrator {
    fn default() -> Self {
        Self {
            model: Irt3pl::default(),
            samples: 2000,
            burn_in: 500,
            proposal_sd: 0.1,
            seed: 42,
        }
    }
}

/// Stable per-item seed offset so results do not depend on run order.
fn item_seed(base: u64, item_id: &str) -> u64 {
    item_id
        .bytes()
        .fold(base ^ 0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
}

impl Calibrator for MetropolisCalibrator {
    fn name(&self) -> &'static str {
        "metropolis"
    }

    fn calibrate(
        &self,
        item: &Item,
        data: &[(f64, bool)],
        prior: &ParamPrior,
    ) -> Result<ParamFit> {
        let mu = centre(item);
        let sd = prior.sds(item.anchor);
        let proposal_sd = [self.proposal_sd, self.proposal_sd, self.proposal_sd * 0.1];
        let proposals: Vec<Normal<f64>> = proposal_sd
            .iter()
            .map(|&s| Normal::new(0.0, s))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| CatError::Config(format!("invalid proposal sd: {e}")))?;

        let mut rng = Pcg64::seed_from_u64(item_seed(self.seed, &item.id));
        let mut current = mu;
        let mut log_post = log_likelihood(&self.model, &current, data) + log_prior(&current, &mu, &sd);

        let mut draws: [Vec<f64>; 3] = [
            Vec::with_capacity(self.samples),
            Vec::with_capacity(self.samples),
            Vec::with_capacity(self.samples),
        ];
        let mut accepted = 0usize;
        let mut proposed = 0usize;

        for step in 0..self.burn_in + self.samples {
            for k in 0..3 {
                let mut candidate = current;
                candidate[k] += rng.sample(&proposals[k]);
                proposed += 1;
                if !in_bounds(&candidate) {
                    continue;
                }
                let cand_post =
                    log_likelihood(&self.model, &candidate, data) + log_prior(&candidate, &mu, &sd);
                if rng.random::<f64>().ln() < cand_post - log_post {
                    current = candidate;
                    log_post = cand_post;
                    accepted += 1;
                }
            }
            if step >= self.burn_in {
                for k in 0..3 {
                    draws[k].push(current[k]);
                }
            }
        }

        if draws[0].is_empty() {
            return Err(CatError::Calibration {
                item_id: item.id.clone(),
                reason: "no posterior draws kept".into(),
            });
        }

        let summarize = |v: &mut Vec<f64>| {
            v.sort_by(|x, y| x.total_cmp(y));
            let mean = v.iter().sum::<f64>() / v.len() as f64;
            ParamEstimate::new(mean, quantile(v, 0.025), quantile(v, 0.975))
        };

        let rate = accepted as f64 / proposed.max(1) as f64;
        let converged = (0.05..=0.95).contains(&rate);
        if !converged {
            warn!(item_id = %item.id, acceptance_rate = rate, "sampler mixing is poor");
        }

        let [da, db, dc] = &mut draws;
        Ok(ParamFit {
            a: summarize(da),
            b: summarize(db),
            c: summarize(dc),
            iterations: self.burn_in + self.samples,
            converged,
        })
    }
}
