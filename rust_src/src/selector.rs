//! Constrained next-item selection.
//!
//! Filter (used, prefilter, exposure cap, zero acceptance) → score → top-N
//! with content and repeat adjustments → weighted draw → Sympson-Hetter gate
//! → optional hard same-topic swap.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::prelude::*;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CatError;
use crate::exposure::{AcceptanceMap, acceptance_of};
use crate::irt::Irt3pl;
use crate::item::{Item, ItemId};
use crate::policy::SelectionPolicy;
use crate::scoring::{BatchScorer, Criterion, ScalarScorer};

/// Upper bound on the content-blueprint boost.
pub const MAX_BLUEPRINT_BOOST: f64 = 0.2;

/// Everything the selector looks at for one decision.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub theta: f64,
    pub pool: &'a [Item],
    pub used: &'a HashSet<ItemId>,
    pub policy: &'a SelectionPolicy,
    /// Pool-wide administration counts; items missing here fall back to
    /// their bank `exposure_count`.
    pub exposure_counts: &'a HashMap<ItemId, u64>,
    /// Administered items per topic in this session.
    pub content_counts: &'a HashMap<String, usize>,
    /// Most recent topic last.
    pub last_topics: &'a [String],
    pub acceptance: &'a AcceptanceMap,
    pub criterion: Criterion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub item: Item,
    /// Criterion value of the chosen item at θ.
    pub info: f64,
    /// Adjusted weight used in the draw.
    pub weight: f64,
    /// Candidates turned away by the acceptance gate first.
    pub gate_rejections: usize,
    /// The hard same-topic rule replaced the drawn item.
    pub topic_swapped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    Selected(Selection),
    Exhausted,
}

impl SelectionOutcome {
    pub fn into_result(self) -> Result<Selection, CatError> {
        match self {
            SelectionOutcome::Selected(sel) => Ok(sel),
            SelectionOutcome::Exhausted => Err(CatError::NoSelectableItems),
        }
    }

    pub fn selected(&self) -> Option<&Selection> {
        match self {
            SelectionOutcome::Selected(sel) => Some(sel),
            SelectionOutcome::Exhausted => None,
        }
    }
}

struct Candidate<'a> {
    item: &'a Item,
    info: f64,
    weight: f64,
}

pub struct Selector {
    model: Irt3pl,
    scorer: Arc<dyn BatchScorer>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(Irt3pl::default(), Arc::new(ScalarScorer))
    }
}

impl Selector {
    pub fn new(model: Irt3pl, scorer: Arc<dyn BatchScorer>) -> Self {
        Self { model, scorer }
    }

    pub fn model(&self) -> &Irt3pl {
        &self.model
    }

    pub fn scorer_name(&self) -> &'static str {
        self.scorer.name()
    }

    /// RNG for one decision: reproducible when the policy carries a seed.
    pub fn rng_for(policy: &SelectionPolicy, items_answered: usize) -> Pcg64 {
        match policy.seed {
            Some(seed) => Pcg64::seed_from_u64(
                seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
                    .wrapping_add(items_answered as u64),
            ),
            None => Pcg64::from_rng(&mut rand::rng()),
        }
    }

    pub fn select_next<R: Rng + ?Sized>(
        &self,
        req: &SelectionRequest<'_>,
        rng: &mut R,
    ) -> SelectionOutcome {
        let policy = req.policy;

        let eligible: Vec<&Item> = req
            .pool
            .iter()
            .filter(|item| !req.used.contains(&item.id))
            .filter(|item| policy.admits(item))
            .filter(|item| {
                let count = req
                    .exposure_counts
                    .get(&item.id)
                    .copied()
                    .unwrap_or(item.exposure_count);
                policy.cap_for(&item.id).is_none_or(|cap| count < cap)
            })
            .filter(|item| acceptance_of(req.acceptance, &item.id) > 0.0)
            .collect();

        if eligible.is_empty() {
            debug!(pool = req.pool.len(), used = req.used.len(), "no selectable items");
            return SelectionOutcome::Exhausted;
        }

        let scores = self
            .scorer
            .score_batch(&self.model, req.theta, &eligible, req.criterion);

        let mut ranked: Vec<(&Item, f64)> = eligible.into_iter().zip(scores).collect();
        ranked.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| ia.id.cmp(&ib.id))
        });

        let top_n = policy.top_n.max(1).min(ranked.len());
        let mut top: Vec<Candidate<'_>> = ranked[..top_n]
            .iter()
            .map(|&(item, info)| Candidate {
                item,
                info,
                weight: adjusted_weight(item, info, req),
            })
            .collect();

        let first = weighted_draw(&top, rng);

        // Drawn candidate first, then the rest by descending weight.
        let mut order: Vec<usize> = (0..top.len()).filter(|&i| i != first).collect();
        order.sort_by(|&x, &y| {
            top[y]
                .weight
                .partial_cmp(&top[x].weight)
                .unwrap_or(Ordering::Equal)
        });
        order.insert(0, first);

        let mut gate_rejections = 0;
        let mut chosen = None;
        for &idx in &order {
            let p = acceptance_of(req.acceptance, &top[idx].item.id);
            if rng.random::<f64>() < p {
                chosen = Some(idx);
                break;
            }
            gate_rejections += 1;
        }
        let chosen = chosen.unwrap_or_else(|| {
            // Every candidate was turned away: take the most acceptable one.
            order
                .iter()
                .copied()
                .max_by(|&x, &y| {
                    acceptance_of(req.acceptance, &top[x].item.id)
                        .partial_cmp(&acceptance_of(req.acceptance, &top[y].item.id))
                        .unwrap_or(Ordering::Equal)
                        .then(y.cmp(&x))
                })
                .unwrap_or(first)
        });

        let mut pick = top.swap_remove(chosen);
        let mut topic_swapped = false;

        if policy.avoid_same_topic_hard {
            if let Some(last) = req.last_topics.last() {
                if &pick.item.topic == last {
                    // Alternatives within tolerance, best first, each through the gate.
                    let alternative = ranked
                        .iter()
                        .filter(|(item, _)| &item.topic != last)
                        .take_while(|&&(_, alt_info)| {
                            !keeps_same_topic(pick.info, alt_info, policy.same_topic_tolerance)
                        })
                        .find(|(item, _)| {
                            rng.random::<f64>() < acceptance_of(req.acceptance, &item.id)
                        });
                    if let Some(&(alt, alt_info)) = alternative {
                        debug!(
                            from = %pick.item.id,
                            to = %alt.id,
                            topic = %last,
                            "same-topic item swapped"
                        );
                        pick = Candidate {
                            item: alt,
                            info: alt_info,
                            weight: adjusted_weight(alt, alt_info, req),
                        };
                        topic_swapped = true;
                    }
                }
            }
        }

        debug!(
            item_id = %pick.item.id,
            info = pick.info,
            weight = pick.weight,
            gate_rejections,
            topic_swapped,
            "item selected"
        );

        SelectionOutcome::Selected(Selection {
            item: pick.item.clone(),
            info: pick.info,
            weight: pick.weight,
            gate_rejections,
            topic_swapped,
        })
    }
}

/// `info × repeat factor × (1 + blueprint boost)`
fn adjusted_weight(item: &Item, info: f64, req: &SelectionRequest<'_>) -> f64 {
    let policy = req.policy;
    let k = policy.avoid_repeat_window;
    let recent = &req.last_topics[req.last_topics.len().saturating_sub(k)..];
    let repeat = if k > 0 && recent.contains(&item.topic) {
        1.0 - policy.repeat_penalty
    } else {
        1.0
    };
    let boost = blueprint_boost(policy, &item.topic, req.content_counts, req.used.len());
    info * repeat * (1.0 + boost)
}

/// Boost proportional to a topic's shortfall against its blueprint target,
/// capped at [`MAX_BLUEPRINT_BOOST`].
pub fn blueprint_boost(
    policy: &SelectionPolicy,
    topic: &str,
    content_counts: &HashMap<String, usize>,
    items_answered: usize,
) -> f64 {
    let Some(&target) = policy.blueprint.get(topic) else {
        return 0.0;
    };
    let achieved = if items_answered == 0 {
        0.0
    } else {
        content_counts.get(topic).copied().unwrap_or(0) as f64 / items_answered as f64
    };
    (policy.blueprint_gain * (target - achieved)).clamp(0.0, MAX_BLUEPRINT_BOOST)
}

/// True when the same-topic item's relative information advantage over the
/// alternative exceeds `tolerance`.
fn keeps_same_topic(orig_info: f64, alt_info: f64, tolerance: f64) -> bool {
    if alt_info <= 0.0 {
        return orig_info > 0.0;
    }
    (orig_info - alt_info) / alt_info > tolerance
}

/// Index drawn proportionally to weight; raw information when no weight is
/// positive, uniform when that is degenerate too.
fn weighted_draw<R: Rng + ?Sized>(candidates: &[Candidate<'_>], rng: &mut R) -> usize {
    let pick_by = |values: &[f64], rng: &mut R| -> Option<usize> {
        let total: f64 = values.iter().filter(|w| **w > 0.0).sum();
        if !(total.is_finite() && total > 0.0) {
            return None;
        }
        let mut r = rng.random::<f64>() * total;
        let mut last_positive = None;
        for (i, &w) in values.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            last_positive = Some(i);
            if r < w {
                return Some(i);
            }
            r -= w;
        }
        last_positive
    };

    let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
    if let Some(i) = pick_by(&weights, &mut *rng) {
        return i;
    }
    let infos: Vec<f64> = candidates.iter().map(|c| c.info).collect();
    if let Some(i) = pick_by(&infos, &mut *rng) {
        return i;
    }
    rng.random_range(0..candidates.len())
}
