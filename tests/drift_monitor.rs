use std::sync::Arc;

use catengine::bank::StaticItemSource;
use catengine::calibration::{ItemCalibration, ParamEstimate};
use catengine::clock::ManualClock;
use catengine::drift::{DriftJobConfig, DriftMonitor, Severity};
use catengine::engine::CatEngine;
use catengine::exposure::ExposureTableHandle;
use catengine::irt::Irt3pl;
use catengine::item::{Item, ItemParams};
use catengine::policy::{InitialItemRule, SessionPolicy};
use catengine::repository::{CalibrationRepository, InMemoryCalibrationRepository};
use catengine::window::{InMemoryResponses, ResponseRecord, Window};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rand::prelude::*;
use rand_distr::Normal;
use rand_pcg::Pcg64;

const BASELINE: &str = "baseline-2025";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn bank() -> Vec<Item> {
    vec![
        Item::new("stable", 1.2, 0.0, 0.15, "algebra").unwrap(),
        Item::new("shifted", 1.2, -0.3, 0.15, "algebra").unwrap(),
        Item::new("sparse", 1.0, 0.5, 0.15, "geometry").unwrap(),
    ]
}

fn simulate(
    rng: &mut Pcg64,
    item_id: &str,
    true_params: ItemParams,
    n: usize,
    answered_at: DateTime<Utc>,
) -> Vec<ResponseRecord> {
    let model = Irt3pl::default();
    let ability = Normal::new(0.0, 1.0).unwrap();
    (0..n)
        .map(|i| {
            let theta: f64 = rng.sample(ability);
            let correct = rng.random::<f64>() < model.probability(theta, &true_params);
            ResponseRecord::new(format!("p{i}"), item_id, correct, theta, answered_at)
        })
        .collect()
}

fn tight_baseline(item: &Item) -> ItemCalibration {
    let mut cal = ItemCalibration::from_bank(item, BASELINE, &Default::default(), now());
    cal.a = ParamEstimate::from_se(item.params.a(), 0.05);
    cal.b = ParamEstimate::from_se(item.params.b(), 0.05);
    cal.c = ParamEstimate::from_se(item.params.c(), 0.02);
    cal
}

struct Fixture {
    monitor: DriftMonitor,
    repository: Arc<InMemoryCalibrationRepository>,
    exposure: Arc<ExposureTableHandle>,
    items: Arc<StaticItemSource>,
}

fn fixture() -> Fixture {
    let items = bank();
    let mut rng = Pcg64::seed_from_u64(2026);
    let recent = now() - TimeDelta::days(1);
    let stale = now() - TimeDelta::days(90);

    let mut records = simulate(&mut rng, "stable", ItemParams::new(1.2, 0.0, 0.15).unwrap(), 4000, recent);
    records.extend(simulate(&mut rng, "shifted", ItemParams::new(1.2, 0.3, 0.15).unwrap(), 4000, recent));
    records.extend(simulate(&mut rng, "sparse", ItemParams::new(1.0, 0.5, 0.15).unwrap(), 20, recent));
    // Outside the trailing window.
    records.extend(simulate(&mut rng, "sparse", ItemParams::new(1.0, 2.5, 0.15).unwrap(), 500, stale));

    let repository = Arc::new(InMemoryCalibrationRepository::new());
    let baseline_window = Window::new(BASELINE, "2025 calibration", stale - TimeDelta::days(365), stale).unwrap();
    repository.save_window(baseline_window).unwrap();
    repository
        .save_calibrations(&[tight_baseline(&items[1])])
        .unwrap();

    let source = Arc::new(StaticItemSource::new(items).unwrap());
    let exposure = Arc::new(ExposureTableHandle::new());
    let monitor = DriftMonitor::new(
        Irt3pl::default(),
        source.clone(),
        Arc::new(InMemoryResponses::new(records)),
        repository.clone(),
        exposure.clone(),
    );
    Fixture {
        monitor,
        repository,
        exposure,
        items: source,
    }
}

fn job() -> DriftJobConfig {
    DriftJobConfig {
        run_id: Some("nightly-1".into()),
        baseline_window_id: Some(BASELINE.into()),
        ..DriftJobConfig::default()
    }
}

#[test]
fn shifted_difficulty_is_flagged_and_excluded() {
    let fx = fixture();
    let report = fx.monitor.run(&job(), now()).unwrap();

    assert_eq!(report.run_id, "nightly-1");
    assert_eq!(report.calibrations.len(), 3);
    assert!(report.failures.is_empty());

    let shifted = report
        .calibrations
        .iter()
        .find(|c| c.item_id == "shifted")
        .unwrap();
    assert!(!shifted.degraded);
    assert!((shifted.b.value - 0.3).abs() < 0.2, "b = {}", shifted.b.value);

    let alerts: Vec<_> = report
        .alerts
        .iter()
        .filter(|a| a.item_id.as_deref() == Some("shifted"))
        .collect();
    let delta_b = alerts.iter().find(|a| a.metric == "delta_b").unwrap();
    assert!(delta_b.severity >= Severity::Medium);
    let separation = alerts
        .iter()
        .find(|a| a.metric == "b_ci_separation")
        .unwrap();
    assert_eq!(separation.severity, Severity::High);

    assert!(report.excluded.contains(&"shifted".to_string()));
    assert_eq!(fx.exposure.current().weight("shifted"), 0.0);
    assert!(report.unresolved_by_severity.get(&Severity::High).copied().unwrap_or(0) >= 1);
}

#[test]
fn thin_items_carry_the_baseline_forward() {
    let fx = fixture();
    let report = fx.monitor.run(&job(), now()).unwrap();

    let sparse = report
        .calibrations
        .iter()
        .find(|c| c.item_id == "sparse")
        .unwrap();
    assert!(sparse.degraded);
    assert_eq!(sparse.n, 20);
    assert_eq!(sparse.b.value, 0.5);
    assert!(report
        .alerts
        .iter()
        .all(|a| a.item_id.as_deref() != Some("sparse")));
    assert_eq!(fx.exposure.current().weight("sparse"), 1.0);
}

#[test]
fn calibrations_and_alerts_are_stored() {
    let fx = fixture();
    let report = fx.monitor.run(&job(), now()).unwrap();

    let stored = fx
        .repository
        .calibration("shifted", &report.window.id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.n, 4000);
    assert_eq!(fx.repository.alerts().unwrap().len(), report.alerts.len());

    for alert in fx.repository.alerts().unwrap() {
        assert!(fx.repository.resolve_alert(alert.id, now()).unwrap());
    }
    assert!(fx.repository.unresolved_alerts().unwrap().is_empty());
}

#[test]
fn unknown_baseline_window_fails_the_run() {
    let fx = fixture();
    let config = DriftJobConfig {
        baseline_window_id: Some("missing".into()),
        ..job()
    };
    assert!(fx.monitor.run(&config, now()).is_err());
}

#[test]
fn engine_skips_items_the_monitor_excluded() {
    let fx = fixture();
    fx.monitor.run(&job(), now()).unwrap();

    let engine = CatEngine::new(fx.items.clone())
        .with_clock(Arc::new(ManualClock::default()))
        .with_acceptance(fx.exposure.clone());
    let mut policy = SessionPolicy::default();
    policy.selection.top_n = 3;
    policy.selection.initial_item = InitialItemRule::ClosestDifficulty;

    for _ in 0..25 {
        // "shifted" is closest to θ0 = -0.3 but carries weight 0.
        let start = engine.start(policy.clone(), -0.3).unwrap();
        assert_ne!(start.next_item.unwrap().id, "shifted");
    }
}
