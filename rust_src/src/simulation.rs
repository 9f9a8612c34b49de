//! Monte-Carlo CAT simulation against examinees of known ability.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::prelude::*;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bank::ItemSource;
use crate::clock::ManualClock;
use crate::config::CatConfig;
use crate::engine::CatEngine;
use crate::error::{CatError, Result};
use crate::item::Item;
use crate::policy::SessionPolicy;
use crate::session::AnswerRequest;

/// Simulated response time per item.
pub const SECONDS_PER_ITEM: f64 = 30.0;

/// One simulated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedRun {
    pub theta: f64,
    pub se: f64,
    pub items: usize,
    pub reason: String,
}

/// Recovery statistics at one true θ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalResult {
    pub true_theta: f64,
    pub bias: f64,
    pub mse: f64,
    pub mean_se: f64,
    pub avg_items: f64,
    /// Termination reason → sessions.
    pub reasons: BTreeMap<String, usize>,
}

/// Run one session to termination for an examinee at `true_theta`.
pub fn simulate_session(
    engine: &CatEngine,
    clock: &ManualClock,
    pool: &HashMap<&str, &Item>,
    policy: SessionPolicy,
    true_theta: f64,
    rng: &mut Pcg64,
) -> Result<SimulatedRun> {
    let theta0 = policy.stop.prior_mean;
    let start = engine.start(policy, theta0)?;
    let session_id = start.session_id;
    let mut next = start.next_item;
    let mut reason = start.reason.map(|r| r.to_string());

    // Each pass either answers an item or waits out a cooldown.
    for _ in 0..=2 * pool.len() {
        let Some(view) = next.take() else {
            break;
        };
        let item = pool
            .get(view.id.as_str())
            .ok_or_else(|| CatError::UnknownItem(view.id.clone()))?;
        let p = engine.model().probability(true_theta, &item.params);
        let correct = rng.random::<f64>() < p;

        clock.advance_secs(SECONDS_PER_ITEM);
        let mut response = engine.answer(AnswerRequest::new(session_id.clone(), view.id, correct))?;
        if let Some(remaining) = response.cooldown_remaining {
            clock.advance_secs(remaining);
            response = engine.next_item(&session_id)?;
        }
        next = response.next_item;
        reason = response.reason;
    }

    let summary = engine.close(&session_id)?;
    Ok(SimulatedRun {
        theta: summary.map.theta,
        se: summary.map.se,
        items: summary.items_answered,
        reason: reason.unwrap_or_else(|| "unfinished".to_string()),
    })
}

/// Bias, MSE and mean test length at each true θ.
///
/// Every θ gets its own engine and clock; replication `r` at θ index `t`
/// is seeded with `seed + 10000·t + r`, so results do not depend on thread
/// scheduling.
pub fn simulate_conditional(
    config: &CatConfig,
    items: Arc<dyn ItemSource>,
    true_thetas: &[f64],
    replications: usize,
    seed: u64,
) -> Result<Vec<ConditionalResult>> {
    if replications == 0 {
        return Err(CatError::Config("replications must be at least 1".into()));
    }
    config.validate()?;
    let bank = items.load_items()?;
    let pool: HashMap<&str, &Item> = bank.iter().map(|i| (i.id.as_str(), i)).collect();

    true_thetas
        .par_iter()
        .enumerate()
        .map(|(t_idx, &true_theta)| {
            let clock = Arc::new(ManualClock::default());
            let engine = config.build_engine(items.clone()).with_clock(clock.clone());

            let mut runs = Vec::with_capacity(replications);
            for rep in 0..replications {
                let task_seed = seed
                    .wrapping_add(t_idx as u64 * 10000)
                    .wrapping_add(rep as u64);
                let mut rng = Pcg64::seed_from_u64(task_seed);
                let mut policy = config.session_policy();
                policy.selection.seed = Some(task_seed);
                runs.push(simulate_session(&engine, &clock, &pool, policy, true_theta, &mut rng)?);
            }

            let n = runs.len() as f64;
            let mean_est = runs.iter().map(|r| r.theta).sum::<f64>() / n;
            let mse = runs
                .iter()
                .map(|r| (r.theta - true_theta).powi(2))
                .sum::<f64>()
                / n;
            let mut reasons = BTreeMap::new();
            for run in &runs {
                *reasons.entry(run.reason.clone()).or_insert(0) += 1;
            }
            debug!(true_theta, bias = mean_est - true_theta, mse, "conditional point done");

            Ok(ConditionalResult {
                true_theta,
                bias: mean_est - true_theta,
                mse,
                mean_se: runs.iter().map(|r| r.se).sum::<f64>() / n,
                avg_items: runs.iter().map(|r| r.items as f64).sum::<f64>() / n,
                reasons,
            })
        })
        .collect()
}
