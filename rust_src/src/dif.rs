//! Differential item functioning by group-specific difficulty.
//!
//! For one item and one group column, the most frequent value is the
//! reference group. Every other value gets its own b with a and c held at
//! the window estimates; the difference against the reference b is tested
//! with a Wald z.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::irt::Irt3pl;
use crate::item::ItemParams;
use crate::utils::{EPSILON, VARIANCE_FLOOR, clip_probability, normal_cdf, sigmoid};
use crate::window::ResponseRecord;

/// Ridge added to the b curvature so tiny groups stay solvable.
const RIDGE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifResult {
    /// Group column, e.g. `"gender"`.
    pub group: String,
    pub reference: String,
    pub focal: String,
    pub n_reference: usize,
    pub n_focal: usize,
    /// Focal b minus reference b.
    pub delta_b: f64,
    pub z: f64,
    pub p_value: f64,
}

impl DifResult {
    pub fn metric(&self) -> String {
        format!("dif_{}", self.group)
    }
}

/// Difficulty for one group with a and c fixed: `(b, se)`.
pub fn group_difficulty(
    model: &Irt3pl,
    params: &ItemParams,
    data: &[(f64, bool)],
    max_iter: usize,
    tol: f64,
) -> (f64, f64) {
    let (a, c) = (params.a(), params.c());
    let d = model.scaling;
    let mut b = params.b();
    let mut info = 0.0;

    for _ in 0..max_iter {
        let mut grad = -RIDGE * (b - params.b());
        info = RIDGE;
        for &(theta, u) in data {
            let s = sigmoid(d * a * (theta - b));
            let p = clip_probability(c + (1.0 - c) * s);
            let dp = -(1.0 - c) * s * (1.0 - s) * d * a;
            let pq = (p * (1.0 - p)).max(VARIANCE_FLOOR);
            let resid = (if u { 1.0 } else { 0.0 }) - p;
            grad += resid * dp / pq;
            info += dp * dp / pq;
        }
        if info < EPSILON {
            break;
        }
        let step = (grad / info).clamp(-1.0, 1.0);
        b = (b + step).clamp(-6.0, 6.0);
        if step.abs() < tol {
            break;
        }
    }

    (b, 1.0 / info.max(EPSILON).sqrt())
}

/// DIF of one item on one group column.
///
/// `records` are the item's responses in the window. Groups (reference
/// included) with fewer than `min_group_size` responses are skipped.
pub fn analyze_dif(
    model: &Irt3pl,
    params: &ItemParams,
    records: &[ResponseRecord],
    column: &str,
    min_group_size: usize,
) -> Vec<DifResult> {
    let mut groups: BTreeMap<&str, Vec<(f64, bool)>> = BTreeMap::new();
    for r in records {
        if let Some(value) = r.groups.get(column) {
            groups
                .entry(value.as_str())
                .or_default()
                .push((r.theta, r.correct));
        }
    }

    // Ties go to the lexicographically smallest value.
    let Some((&reference, ref_data)) = groups
        .iter()
        .max_by(|(ka, va), (kb, vb)| va.len().cmp(&vb.len()).then(kb.cmp(ka)))
    else {
        return Vec::new();
    };
    if ref_data.len() < min_group_size.max(1) {
        return Vec::new();
    }

    let (b_ref, se_ref) = group_difficulty(model, params, ref_data, 50, 1e-6);

    groups
        .iter()
        .filter(|(value, data)| **value != reference && data.len() >= min_group_size.max(1))
        .map(|(&focal, data)| {
            let (b_focal, se_focal) = group_difficulty(model, params, data, 50, 1e-6);
            let delta_b = b_focal - b_ref;
            let z = delta_b / (se_ref * se_ref + se_focal * se_focal).sqrt();
            DifResult {
                group: column.to_string(),
                reference: reference.to_string(),
                focal: focal.to_string(),
                n_reference: ref_data.len(),
                n_focal: data.len(),
                delta_b,
                z,
                p_value: 2.0 * (1.0 - normal_cdf(z.abs())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::tests::simulate;
    use chrono::{DateTime, Utc};

    fn records(group: &str, data: &[(f64, bool)]) -> Vec<ResponseRecord> {
        data.iter()
            .enumerate()
            .map(|(i, &(theta, correct))| {
                ResponseRecord::new(
                    format!("{group}-{i}"),
                    "q1",
                    correct,
                    theta,
                    DateTime::<Utc>::UNIX_EPOCH,
                )
                .with_group("grp", group)
            })
            .collect()
    }

    fn params() -> ItemParams {
        ItemParams::new(1.0, 0.0, 0.2).unwrap()
    }

    #[test]
    fn flags_shifted_focal_group() {
        let mut recs = records("ref", &simulate(3000, 1.0, 0.0, 0.2, 1));
        recs.extend(records("focal", &simulate(2000, 1.0, 0.8, 0.2, 2)));
        let res = analyze_dif(&Irt3pl::default(), &params(), &recs, "grp", 50);
        assert_eq!(res.len(), 1);
        let r = &res[0];
        assert_eq!(r.reference, "ref");
        assert_eq!(r.focal, "focal");
        assert_eq!(r.metric(), "dif_grp");
        assert!((r.delta_b - 0.8).abs() < 0.3, "delta_b = {}", r.delta_b);
        assert!(r.z > 3.0);
        assert!(r.p_value < 0.01);
    }

    #[test]
    fn equal_groups_show_little_dif() {
        let mut recs = records("x", &simulate(3000, 1.0, 0.0, 0.2, 5));
        recs.extend(records("y", &simulate(2500, 1.0, 0.0, 0.2, 6)));
        let res = analyze_dif(&Irt3pl::default(), &params(), &recs, "grp", 50);
        assert_eq!(res.len(), 1);
        assert!(res[0].delta_b.abs() < 0.3);
    }

    #[test]
    fn small_groups_are_skipped() {
        let mut recs = records("ref", &simulate(500, 1.0, 0.0, 0.2, 1));
        recs.extend(records("tiny", &simulate(10, 1.0, 0.0, 0.2, 2)));
        assert!(analyze_dif(&Irt3pl::default(), &params(), &recs, "grp", 50).is_empty());
        assert!(analyze_dif(&Irt3pl::default(), &params(), &recs, "missing", 50).is_empty());
    }
}
