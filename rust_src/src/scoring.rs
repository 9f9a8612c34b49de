//! Batch scoring of candidate items at a given θ.
//!
//! Selection only talks to [`BatchScorer`]; the scalar loop is the reference
//! and the ndarray / rayon versions must agree with it.

use std::sync::Arc;

use ndarray::{Array1, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::irt::Irt3pl;
use crate::item::{Item, ItemParams};
use crate::utils::{VARIANCE_FLOOR, clip_probability, sigmoid};

/// What an item is scored by.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    /// Fisher information at θ.
    #[default]
    Fisher,
    /// Symmetric KL divergence between θ and θ + δ.
    Kl { delta: f64 },
    /// `1 / (1 + |b - θ|)`, used for the opening item.
    DifficultyProximity,
}

impl Criterion {
    #[inline]
    pub fn score(&self, model: &Irt3pl, theta: f64, p: &ItemParams) -> f64 {
        match *self {
            Criterion::Fisher => model.information(theta, p),
            Criterion::Kl { delta } => model.kl_information(theta, p, delta),
            Criterion::DifficultyProximity => 1.0 / (1.0 + (p.b() - theta).abs()),
        }
    }
}

pub trait BatchScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// One score per item, in input order.
    fn score_batch(
        &self,
        model: &Irt3pl,
        theta: f64,
        items: &[&Item],
        criterion: Criterion,
    ) -> Vec<f64>;
}

/// Reference implementation: one item at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarScorer;

impl BatchScorer for ScalarScorer {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn score_batch(
        &self,
        model: &Irt3pl,
        theta: f64,
        items: &[&Item],
        criterion: Criterion,
    ) -> Vec<f64> {
        items
            .iter()
            .map(|item| criterion.score(model, theta, &item.params))
            .collect()
    }
}

/// Column-wise evaluation over ndarray vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizedScorer;

impl VectorizedScorer {
    /// Returns `(P, σ)` per item.
    fn probabilities(
        model: &Irt3pl,
        theta: f64,
        a: &Array1<f64>,
        b: &Array1<f64>,
        c: &Array1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        let z = Zip::from(a)
            .and(b)
            .map_collect(|&a, &b| model.scaling * a * (theta - b));
        let s = z.mapv(sigmoid);
        let p = Zip::from(c).and(&s).map_collect(|&c, &s| c + (1.0 - c) * s);
        (p, s)
    }
}

impl BatchScorer for VectorizedScorer {
    fn name(&self) -> &'static str {
        "vectorized"
    }

    fn score_batch(
        &self,
        model: &Irt3pl,
        theta: f64,
        items: &[&Item],
        criterion: Criterion,
    ) -> Vec<f64> {
        let a: Array1<f64> = items.iter().map(|i| i.params.a()).collect();
        let b: Array1<f64> = items.iter().map(|i| i.params.b()).collect();
        let c: Array1<f64> = items.iter().map(|i| i.params.c()).collect();

        let scores = match criterion {
            Criterion::Fisher => {
                let (p, s) = Self::probabilities(model, theta, &a, &b, &c);
                let mut out = Array1::<f64>::zeros(items.len());
                Zip::from(&mut out)
                    .and(&a)
                    .and(&c)
                    .and(&p)
                    .and(&s)
                    .for_each(|o, &a, &c, &p, &s| {
                        let d = model.scaling * a * (1.0 - c) * s * (1.0 - s);
                        let denom = (p * (1.0 - p)).max(VARIANCE_FLOOR);
                        *o = (d * d / denom).max(0.0);
                    });
                out
            }
            Criterion::Kl { delta } => {
                let (p1, _) = Self::probabilities(model, theta, &a, &b, &c);
                let (p2, _) = Self::probabilities(model, theta + delta, &a, &b, &c);
                Zip::from(&p1).and(&p2).map_collect(|&p1, &p2| {
                    let p1 = clip_probability(p1);
                    let p2 = clip_probability(p2);
                    ((p1 - p2) * ((p1 / p2).ln() - ((1.0 - p1) / (1.0 - p2)).ln())).max(0.0)
                })
            }
            Criterion::DifficultyProximity => b.mapv(|b| 1.0 / (1.0 + (b - theta).abs())),
        };

        scores.to_vec()
    }
}

/// Rayon fan-out for large pools; small batches stay on the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct ParallelScorer {
    pub min_parallel: usize,
}

impl Default for ParallelScorer {
    fn default() -> Self {
        Self { min_parallel: 512 }
    }
}

impl BatchScorer for ParallelScorer {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn score_batch(
        &self,
        model: &Irt3pl,
        theta: f64,
        items: &[&Item],
        criterion: Criterion,
    ) -> Vec<f64> {
        if items.len() < self.min_parallel {
            return ScalarScorer.score_batch(model, theta, items, criterion);
        }
        items
            .par_iter()
            .map(|item| criterion.score(model, theta, &item.params))
            .collect()
    }
}

/// Config-facing scorer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    #[default]
    Scalar,
    Vectorized,
    Parallel,
}

impl ScorerKind {
    pub fn build(self) -> Arc<dyn BatchScorer> {
        match self {
            ScorerKind::Scalar => Arc::new(ScalarScorer),
            ScorerKind::Vectorized => Arc::new(VectorizedScorer),
            ScorerKind::Parallel => Arc::new(ParallelScorer::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vec<Item> {
        (0..40)
            .map(|i| {
                let f = i as f64;
                Item::new(
                    format!("i{i}"),
                    0.5 + (f * 0.37) % 2.0,
                    -3.0 + f * 0.15,
                    (f * 0.013) % 0.3,
                    "t",
                )
                .unwrap()
            })
            .collect()
    }

    fn assert_close(lhs: &[f64], rhs: &[f64]) {
        assert_eq!(lhs.len(), rhs.len());
        for (l, r) in lhs.iter().zip(rhs) {
            assert!((l - r).abs() < 1e-12, "{l} vs {r}");
        }
    }

    #[test]
    fn implementations_agree() {
        let items = pool();
        let refs: Vec<&Item> = items.iter().collect();
        let model = Irt3pl::default();
        let parallel = ParallelScorer { min_parallel: 1 };

        for criterion in [
            Criterion::Fisher,
            Criterion::Kl { delta: 0.3 },
            Criterion::DifficultyProximity,
        ] {
            for theta in [-2.5, 0.0, 1.7] {
                let scalar = ScalarScorer.score_batch(&model, theta, &refs, criterion);
                let vectorized = VectorizedScorer.score_batch(&model, theta, &refs, criterion);
                let par = parallel.score_batch(&model, theta, &refs, criterion);
                assert_close(&scalar, &vectorized);
                assert_close(&scalar, &par);
            }
        }
    }

    #[test]
    fn empty_batch_scores_to_empty() {
        let model = Irt3pl::default();
        assert!(VectorizedScorer
            .score_batch(&model, 0.0, &[], Criterion::Fisher)
            .is_empty());
    }

    #[test]
    fn criterion_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            criterion: Criterion,
        }
        let w: Wrap = toml::from_str("criterion = { kind = \"kl\", delta = 0.25 }").unwrap();
        assert_eq!(w.criterion, Criterion::Kl { delta: 0.25 });
    }
}
