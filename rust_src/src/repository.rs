//! Storage seam for windows, calibrations and drift alerts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::calibration::ItemCalibration;
use crate::drift::DriftAlert;
use crate::error::Result;
use crate::item::ItemId;
use crate::window::Window;

pub trait CalibrationRepository: Send + Sync {
    fn save_window(&self, window: Window) -> Result<()>;

    fn window(&self, id: &str) -> Result<Option<Window>>;

    /// Calibrations are append-only; a later save for the same item and
    /// window supersedes the earlier one for lookups.
    fn save_calibrations(&self, calibrations: &[ItemCalibration]) -> Result<()>;

    fn calibration(&self, item_id: &str, window_id: &str) -> Result<Option<ItemCalibration>>;

    fn save_alerts(&self, alerts: &[DriftAlert]) -> Result<()>;

    fn alerts(&self) -> Result<Vec<DriftAlert>>;

    fn unresolved_alerts(&self) -> Result<Vec<DriftAlert>> {
        Ok(self
            .alerts()?
            .into_iter()
            .filter(DriftAlert::is_unresolved)
            .collect())
    }

    /// Mark an alert resolved. Returns false for unknown or already
    /// resolved alerts.
    fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    windows: HashMap<String, Window>,
    calibrations: Vec<ItemCalibration>,
    latest: HashMap<(ItemId, String), usize>,
    alerts: Vec<DriftAlert>,
}

#[derive(Default)]
pub struct InMemoryCalibrationRepository {
    tables: RwLock<Tables>,
}

impl InMemoryCalibrationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calibration_count(&self) -> usize {
        self.tables.read().calibrations.len()
    }
}

impl CalibrationRepository for InMemoryCalibrationRepository {
    fn save_window(&self, window: Window) -> Result<()> {
        self.tables.write().windows.insert(window.id.clone(), window);
        Ok(())
    }

    fn window(&self, id: &str) -> Result<Option<Window>> {
        Ok(self.tables.read().windows.get(id).cloned())
    }

    fn save_calibrations(&self, calibrations: &[ItemCalibration]) -> Result<()> {
        let mut t = self.tables.write();
        for cal in calibrations {
            let idx = t.calibrations.len();
            t.calibrations.push(cal.clone());
            t.latest
                .insert((cal.item_id.clone(), cal.window_id.clone()), idx);
        }
        Ok(())
    }

    fn calibration(&self, item_id: &str, window_id: &str) -> Result<Option<ItemCalibration>> {
        let t = self.tables.read();
        Ok(t
            .latest
            .get(&(item_id.to_string(), window_id.to_string()))
            .and_then(|&idx| t.calibrations.get(idx))
            .cloned())
    }

    fn save_alerts(&self, alerts: &[DriftAlert]) -> Result<()> {
        self.tables.write().alerts.extend_from_slice(alerts);
        Ok(())
    }

    fn alerts(&self) -> Result<Vec<DriftAlert>> {
        Ok(self.tables.read().alerts.clone())
    }

    fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(alert) = t.alerts.iter_mut().find(|a| a.id == id) else {
            return Ok(false);
        };
        if alert.resolved_at.is_some() {
            return Ok(false);
        }
        alert.resolved_at = Some(at);
        info!(alert_id = %id, metric = %alert.metric, "drift alert resolved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ParamPrior;
    use crate::drift::Severity;
    use crate::item::Item;

    #[test]
    fn latest_calibration_wins() {
        let repo = InMemoryCalibrationRepository::new();
        let item = Item::new("q1", 1.0, 0.0, 0.2, "t").unwrap();
        let first = ItemCalibration::from_bank(&item, "w1", &ParamPrior::default(), Utc::now());
        let mut second = first.clone();
        second.n = 99;
        repo.save_calibrations(&[first]).unwrap();
        repo.save_calibrations(&[second]).unwrap();
        assert_eq!(repo.calibration_count(), 2);
        assert_eq!(repo.calibration("q1", "w1").unwrap().unwrap().n, 99);
        assert!(repo.calibration("q1", "w2").unwrap().is_none());
    }

    #[test]
    fn resolving_alerts() {
        let repo = InMemoryCalibrationRepository::new();
        let alert = DriftAlert::new(
            Some("q1".into()),
            "w1",
            "delta_b",
            0.8,
            0.25,
            Severity::High,
            Utc::now(),
        );
        let id = alert.id;
        repo.save_alerts(&[alert]).unwrap();
        assert_eq!(repo.unresolved_alerts().unwrap().len(), 1);

        assert!(repo.resolve_alert(id, Utc::now()).unwrap());
        assert!(!repo.resolve_alert(id, Utc::now()).unwrap());
        assert!(!repo.resolve_alert(Uuid::new_v4(), Utc::now()).unwrap());
        assert!(repo.unresolved_alerts().unwrap().is_empty());
        assert_eq!(repo.alerts().unwrap().len(), 1);
    }
}
