//! Item parameter drift: alerts, detection and the periodic monitor job.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bank::ItemSource;
use crate::calibration::{
    Calibrator, ItemCalibration, LaplaceCalibrator, MetropolisCalibrator, ParamPrior,
};
use crate::dif::analyze_dif;
use crate::error::{CatError, Result};
use crate::exposure::{ExposureTableHandle, ExposureWeightTable};
use crate::irt::Irt3pl;
use crate::item::{Item, ItemId};
use crate::repository::CalibrationRepository;
use crate::window::{ResponseRecord, ResponseSource, Window};

/// Window id used when no baseline window is configured.
pub const BANK_WINDOW_ID: &str = "bank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Breakpoints at 1, 2 and 3 times the threshold.
    pub fn from_ratio(ratio: f64) -> Option<Self> {
        if !ratio.is_finite() {
            return None;
        }
        if ratio >= 3.0 {
            Some(Severity::High)
        } else if ratio >= 2.0 {
            Some(Severity::Medium)
        } else if ratio >= 1.0 {
            Some(Severity::Low)
        } else {
            None
        }
    }

    pub fn classify(observed: f64, threshold: f64) -> Option<Self> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return None;
        }
        Self::from_ratio(observed / threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub id: Uuid,
    /// `None` for test-level alerts.
    pub item_id: Option<ItemId>,
    pub window_id: String,
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DriftAlert {
    pub fn new(
        item_id: Option<ItemId>,
        window_id: impl Into<String>,
        metric: impl Into<String>,
        observed: f64,
        threshold: f64,
        severity: Severity,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_id,
            window_id: window_id.into(),
            metric: metric.into(),
            observed,
            threshold,
            severity,
            created_at,
            resolved_at: None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    pub delta_a: f64,
    pub delta_b: f64,
    /// Signed increase in guessing.
    pub delta_c: f64,
    pub dif_z: f64,
    /// Mean signed Δb over anchor items.
    pub anchor_shift: f64,
    /// Raise a high alert when recent b̂ leaves the baseline interval.
    pub b_ci_separation: bool,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            delta_a: 0.3,
            delta_b: 0.25,
            delta_c: 0.05,
            dif_z: 2.0,
            anchor_shift: 0.2,
            b_ci_separation: true,
        }
    }
}

/// Alerts for every criterion `recent` exceeds against `baseline`.
pub fn detect_drift(
    baseline: &ItemCalibration,
    recent: &ItemCalibration,
    thresholds: &DriftThresholds,
    now: DateTime<Utc>,
) -> Vec<DriftAlert> {
    let mut alerts = Vec::new();
    let mut raise = |metric: String, observed: f64, threshold: f64, severity: Option<Severity>| {
        if let Some(severity) = severity {
            alerts.push(DriftAlert::new(
                Some(recent.item_id.clone()),
                recent.window_id.clone(),
                metric,
                observed,
                threshold,
                severity,
                now,
            ));
        }
    };

    let da = (recent.a.value - baseline.a.value).abs();
    raise("delta_a".into(), da, thresholds.delta_a, Severity::classify(da, thresholds.delta_a));

    let db = (recent.b.value - baseline.b.value).abs();
    raise("delta_b".into(), db, thresholds.delta_b, Severity::classify(db, thresholds.delta_b));

    let dc = recent.c.value - baseline.c.value;
    raise("delta_c".into(), dc, thresholds.delta_c, Severity::classify(dc, thresholds.delta_c));

    if thresholds.b_ci_separation && !baseline.b.contains(recent.b.value) {
        let half_width = baseline.b.width() / 2.0;
        raise("b_ci_separation".into(), db, half_width, Some(Severity::High));
    }

    for dif in &recent.dif {
        let z = dif.z.abs();
        raise(dif.metric(), z, thresholds.dif_z, Severity::classify(z, thresholds.dif_z));
    }

    alerts
}

/// Test-level alert when anchors move together; `shifts` are
/// `(baseline b, recent b)` pairs.
pub fn anchor_mean_shift(
    shifts: &[(f64, f64)],
    threshold: f64,
    window_id: &str,
    now: DateTime<Utc>,
) -> Option<DriftAlert> {
    if shifts.is_empty() {
        return None;
    }
    let mean = shifts.iter().map(|(base, recent)| recent - base).sum::<f64>() / shifts.len() as f64;
    let severity = Severity::classify(mean.abs(), threshold)?;
    Some(DriftAlert::new(
        None,
        window_id,
        "anchor_mean_shift",
        mean,
        threshold,
        severity,
        now,
    ))
}

/// Re-estimation backend for a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibratorKind {
    #[default]
    Laplace,
    Metropolis {
        samples: usize,
        burn_in: usize,
        seed: u64,
    },
}

impl CalibratorKind {
    pub fn build(self, model: Irt3pl, max_iter: usize, tol: f64) -> Arc<dyn Calibrator> {
        match self {
            CalibratorKind::Laplace => Arc::new(LaplaceCalibrator::new(model, max_iter, tol)),
            CalibratorKind::Metropolis {
                samples,
                burn_in,
                seed,
            } => Arc::new(MetropolisCalibrator {
                model,
                samples,
                burn_in,
                seed,
                ..MetropolisCalibrator::default()
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftJobConfig {
    /// Generated when absent.
    pub run_id: Option<String>,
    pub recent_window_days: u32,
    /// Falls back to the bank parameters when absent.
    pub baseline_window_id: Option<String>,
    pub min_sample: usize,
    pub thresholds: DriftThresholds,
    pub dif_groups: Vec<String>,
    pub dif_min_group_size: usize,
    pub prior: ParamPrior,
    pub calibrator: CalibratorKind,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for DriftJobConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            recent_window_days: 30,
            baseline_window_id: None,
            min_sample: 200,
            thresholds: DriftThresholds::default(),
            dif_groups: Vec::new(),
            dif_min_group_size: 50,
            prior: ParamPrior::default(),
            calibrator: CalibratorKind::Laplace,
            max_iter: 100,
            tol: 1e-5,
        }
    }
}

impl DriftJobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recent_window_days == 0 {
            return Err(CatError::Config("recent_window_days must be at least 1".into()));
        }
        if self.max_iter == 0 {
            return Err(CatError::Config("max_iter must be at least 1".into()));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(CatError::Config("tol must be positive".into()));
        }
        self.prior.validate()
    }
}

/// An item the run could not process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub run_id: String,
    pub window: Window,
    pub calibrations: Vec<ItemCalibration>,
    /// Alerts raised by this run.
    pub alerts: Vec<DriftAlert>,
    pub failures: Vec<ItemFailure>,
    pub exposure_table: ExposureWeightTable,
    pub excluded: Vec<ItemId>,
    /// Over every unresolved alert in the repository, not only this run's.
    pub unresolved_by_severity: BTreeMap<Severity, usize>,
}

struct ItemOutcome {
    calibration: ItemCalibration,
    alerts: Vec<DriftAlert>,
    anchor_shift: Option<(f64, f64)>,
}

fn require_sample(item_id: &str, n: usize, min: usize) -> Result<()> {
    if n < min {
        return Err(CatError::InsufficientSample {
            item_id: item_id.to_string(),
            n,
            min,
        });
    }
    Ok(())
}

/// Periodic recalibration over the recent window.
///
/// Shares nothing with live sessions except the exposure table handle.
pub struct DriftMonitor {
    model: Irt3pl,
    items: Arc<dyn ItemSource>,
    responses: Arc<dyn ResponseSource>,
    repository: Arc<dyn CalibrationRepository>,
    exposure: Arc<ExposureTableHandle>,
}

impl DriftMonitor {
    pub fn new(
        model: Irt3pl,
        items: Arc<dyn ItemSource>,
        responses: Arc<dyn ResponseSource>,
        repository: Arc<dyn CalibrationRepository>,
        exposure: Arc<ExposureTableHandle>,
    ) -> Self {
        Self {
            model,
            items,
            responses,
            repository,
            exposure,
        }
    }

    pub fn exposure(&self) -> &Arc<ExposureTableHandle> {
        &self.exposure
    }

    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub fn run(&self, config: &DriftJobConfig, now: DateTime<Utc>) -> Result<DriftReport> {
        config.validate()?;
        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("run_id", run_id.as_str());

        let items = self.items.load_items()?;
        let window = Window::trailing(format!("recent-{run_id}"), now, config.recent_window_days)?;
        self.repository.save_window(window.clone())?;

        let baseline_window = match &config.baseline_window_id {
            Some(id) => Some(
                self.repository
                    .window(id)?
                    .ok_or_else(|| CatError::UnknownWindow(id.clone()))?,
            ),
            None => None,
        };

        let mut by_item: HashMap<ItemId, Vec<ResponseRecord>> = HashMap::new();
        for record in self.responses.responses(&window)? {
            by_item.entry(record.item_id.clone()).or_default().push(record);
        }
        info!(
            items = items.len(),
            responses = by_item.values().map(Vec::len).sum::<usize>(),
            window = %window.id,
            "drift run started"
        );

        let calibrator = config.calibrator.build(self.model, config.max_iter, config.tol);
        let empty = Vec::new();

        let results: Vec<(ItemId, Result<ItemOutcome>)> = items
            .par_iter()
            .map(|item| {
                let records = by_item.get(&item.id).unwrap_or(&empty);
                let outcome = self.process_item(
                    item,
                    records,
                    baseline_window.as_ref(),
                    &window,
                    calibrator.as_ref(),
                    config,
                    now,
                );
                (item.id.clone(), outcome)
            })
            .collect();

        let mut calibrations = Vec::new();
        let mut alerts = Vec::new();
        let mut failures = Vec::new();
        let mut anchor_shifts = Vec::new();
        for (item_id, outcome) in results {
            match outcome {
                Ok(out) => {
                    calibrations.push(out.calibration);
                    alerts.extend(out.alerts);
                    anchor_shifts.extend(out.anchor_shift);
                }
                Err(err) => {
                    warn!(item_id = %item_id, error = %err, "item skipped in drift run");
                    failures.push(ItemFailure {
                        item_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Some(alert) = anchor_mean_shift(
            &anchor_shifts,
            config.thresholds.anchor_shift,
            &window.id,
            now,
        ) {
            warn!(observed = alert.observed, "anchor items shifted together");
            alerts.push(alert);
        }

        self.repository.save_calibrations(&calibrations)?;
        self.repository.save_alerts(&alerts)?;

        let unresolved = self.repository.unresolved_alerts()?;
        let mut unresolved_by_severity = BTreeMap::new();
        for alert in &unresolved {
            *unresolved_by_severity.entry(alert.severity).or_insert(0) += 1;
        }

        let ids: Vec<ItemId> = items.iter().map(|i| i.id.clone()).collect();
        let table = ExposureWeightTable::from_alerts(&ids, &unresolved, Some(run_id.clone()), now);
        let version = self.exposure.publish(table);
        let exposure_table = (*self.exposure.current()).clone();
        let excluded = exposure_table.excluded();

        info!(
            version,
            calibrated = calibrations.len(),
            alerts = alerts.len(),
            failures = failures.len(),
            excluded = excluded.len(),
            "drift run finished"
        );

        Ok(DriftReport {
            run_id,
            window,
            calibrations,
            alerts,
            failures,
            exposure_table,
            excluded,
            unresolved_by_severity,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn process_item(
        &self,
        item: &Item,
        records: &[ResponseRecord],
        baseline_window: Option<&Window>,
        window: &Window,
        calibrator: &dyn Calibrator,
        config: &DriftJobConfig,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let baseline = match baseline_window {
            Some(w) => self
                .repository
                .calibration(&item.id, &w.id)?
                .unwrap_or_else(|| ItemCalibration::from_bank(item, w.id.clone(), &config.prior, now)),
            None => ItemCalibration::from_bank(item, BANK_WINDOW_ID, &config.prior, now),
        };

        if let Err(err) = require_sample(&item.id, records.len(), config.min_sample) {
            debug!(item_id = %item.id, error = %err, "carrying baseline forward");
            return Ok(ItemOutcome {
                calibration: ItemCalibration::degraded_from(&baseline, window.id.clone(), records.len(), now),
                alerts: Vec::new(),
                anchor_shift: None,
            });
        }

        let data: Vec<(f64, bool)> = records.iter().map(|r| (r.theta, r.correct)).collect();
        let fit = calibrator.calibrate(item, &data, &config.prior)?;
        let mut recent = ItemCalibration::from_fit(item.id.clone(), window.id.clone(), &fit, data.len(), now);

        if !config.dif_groups.is_empty() {
            let params = recent.params()?;
            for column in &config.dif_groups {
                recent.dif.extend(analyze_dif(
                    &self.model,
                    &params,
                    records,
                    column,
                    config.dif_min_group_size,
                ));
            }
        }

        let alerts = detect_drift(&baseline, &recent, &config.thresholds, now);
        recent.severity = alerts.iter().map(|a| a.severity).max();
        if let Some(severity) = recent.severity {
            debug!(item_id = %item.id, ?severity, alerts = alerts.len(), "drift detected");
        }

        Ok(ItemOutcome {
            anchor_shift: item.anchor.then_some((baseline.b.value, recent.b.value)),
            calibration: recent,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ParamEstimate;

    fn calibration(b: f64, lower: f64, upper: f64) -> ItemCalibration {
        ItemCalibration {
            item_id: "q1".into(),
            window_id: "w".into(),
            a: ParamEstimate::new(1.0, 0.9, 1.1),
            b: ParamEstimate::new(b, lower, upper),
            c: ParamEstimate::new(0.2, 0.18, 0.22),
            n: 500,
            converged: true,
            degraded: false,
            dif: Vec::new(),
            severity: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn severity_breakpoints() {
        assert_eq!(Severity::from_ratio(0.99), None);
        assert_eq!(Severity::from_ratio(1.0), Some(Severity::Low));
        assert_eq!(Severity::from_ratio(2.4), Some(Severity::Medium));
        assert_eq!(Severity::from_ratio(3.0), Some(Severity::High));
        assert_eq!(Severity::classify(1.0, 0.0), None);
        assert!(Severity::High > Severity::Low);
    }

    #[test]
    fn difficulty_shift_raises_delta_and_separation_alerts() {
        let baseline = calibration(0.0, -0.1, 0.1);
        let recent = calibration(0.6, 0.5, 0.7);
        let alerts = detect_drift(&baseline, &recent, &DriftThresholds::default(), Utc::now());

        let delta_b = alerts.iter().find(|a| a.metric == "delta_b").unwrap();
        assert!(delta_b.severity >= Severity::Medium);
        let sep = alerts.iter().find(|a| a.metric == "b_ci_separation").unwrap();
        assert_eq!(sep.severity, Severity::High);
        assert!(alerts.iter().all(|a| a.metric != "delta_a"));
        assert!(alerts.iter().all(|a| a.item_id.as_deref() == Some("q1")));
    }

    #[test]
    fn guessing_alert_only_on_increase() {
        let baseline = calibration(0.0, -0.1, 0.1);
        let mut recent = calibration(0.0, -0.1, 0.1);
        recent.c = ParamEstimate::new(0.05, 0.0, 0.1);
        let alerts = detect_drift(&baseline, &recent, &DriftThresholds::default(), Utc::now());
        assert!(alerts.iter().all(|a| a.metric != "delta_c"));

        recent.c = ParamEstimate::new(0.32, 0.3, 0.34);
        let alerts = detect_drift(&baseline, &recent, &DriftThresholds::default(), Utc::now());
        let dc = alerts.iter().find(|a| a.metric == "delta_c").unwrap();
        assert_eq!(dc.severity, Severity::Medium);
    }

    #[test]
    fn dif_results_raise_group_alerts() {
        let baseline = calibration(0.0, -0.1, 0.1);
        let mut recent = calibration(0.0, -0.1, 0.1);
        recent.dif.push(crate::dif::DifResult {
            group: "region".into(),
            reference: "north".into(),
            focal: "south".into(),
            n_reference: 300,
            n_focal: 200,
            delta_b: -0.5,
            z: -4.5,
            p_value: 1e-5,
        });
        let alerts = detect_drift(&baseline, &recent, &DriftThresholds::default(), Utc::now());
        let dif = alerts.iter().find(|a| a.metric == "dif_region").unwrap();
        assert_eq!(dif.severity, Severity::Medium);
        assert_eq!(dif.observed, 4.5);
    }

    #[test]
    fn anchor_shift_is_test_level() {
        let now = Utc::now();
        assert!(anchor_mean_shift(&[], 0.2, "w", now).is_none());
        assert!(anchor_mean_shift(&[(0.0, 0.1), (0.5, 0.55)], 0.2, "w", now).is_none());

        let alert = anchor_mean_shift(&[(0.0, 0.5), (1.0, 1.4)], 0.2, "w", now).unwrap();
        assert_eq!(alert.item_id, None);
        assert_eq!(alert.metric, "anchor_mean_shift");
        assert_eq!(alert.severity, Severity::Medium);
    }

    #[test]
    fn job_config_from_partial_toml() {
        let cfg: DriftJobConfig = toml::from_str(
            r#"
            min_sample = 100
            dif_groups = ["region"]
            [thresholds]
            delta_b = 0.3
            [calibrator]
            kind = "metropolis"
            samples = 500
            burn_in = 100
            seed = 9
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.min_sample, 100);
        assert_eq!(cfg.thresholds.delta_b, 0.3);
        assert_eq!(cfg.thresholds.delta_a, 0.3);
        assert_eq!(cfg.recent_window_days, 30);
        assert!(matches!(cfg.calibrator, CalibratorKind::Metropolis { seed: 9, .. }));
    }
}
