//! Acceptance probabilities for the Sympson-Hetter gate and the exposure
//! weight table the drift monitor publishes into it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::TtlCache;
use crate::drift::{DriftAlert, Severity};
use crate::error::Result;
use crate::item::ItemId;

/// Item id → acceptance probability in [0, 1]. Missing ids mean 1.0.
pub type AcceptanceMap = HashMap<ItemId, f64>;

pub trait AcceptanceSource: Send + Sync {
    fn load(&self) -> Result<Arc<AcceptanceMap>>;
}

/// Probability an item passes the gate under `map`.
#[inline]
pub fn acceptance_of(map: &AcceptanceMap, item_id: &str) -> f64 {
    map.get(item_id).copied().unwrap_or(1.0).clamp(0.0, 1.0)
}

/// Fixed map, e.g. supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct StaticAcceptance {
    map: Arc<AcceptanceMap>,
}

impl StaticAcceptance {
    pub fn new(map: AcceptanceMap) -> Self {
        Self { map: Arc::new(map) }
    }
}

impl AcceptanceSource for StaticAcceptance {
    fn load(&self) -> Result<Arc<AcceptanceMap>> {
        Ok(self.map.clone())
    }
}

/// JSON object `{ "item_id": p, ... }` on disk, re-read after the TTL.
pub struct JsonFileAcceptance {
    path: PathBuf,
    cache: TtlCache<AcceptanceMap>,
}

impl JsonFileAcceptance {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            cache: TtlCache::new("acceptance_file", ttl),
        }
    }

    fn read(path: &Path) -> Result<AcceptanceMap> {
        let raw = std::fs::read_to_string(path)?;
        let map: AcceptanceMap = serde_json::from_str(&raw)?;
        Ok(map
            .into_iter()
            .map(|(id, p)| (id, if p.is_finite() { p.clamp(0.0, 1.0) } else { 1.0 }))
            .collect())
    }
}

impl AcceptanceSource for JsonFileAcceptance {
    fn load(&self) -> Result<Arc<AcceptanceMap>> {
        self.cache.get_or_load(|| Self::read(&self.path))
    }
}

/// Exposure weights derived from unresolved drift alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureWeightTable {
    pub version: u64,
    pub run_id: Option<String>,
    pub published_at: DateTime<Utc>,
    pub weights: BTreeMap<ItemId, f64>,
}

impl ExposureWeightTable {
    pub fn empty() -> Self {
        Self {
            version: 0,
            run_id: None,
            published_at: DateTime::<Utc>::UNIX_EPOCH,
            weights: BTreeMap::new(),
        }
    }

    /// Weight applied for an alert severity.
    pub fn weight_for(severity: Severity) -> f64 {
        match severity {
            Severity::High => 0.0,
            Severity::Medium => 0.5,
            Severity::Low => 0.8,
        }
    }

    /// Every listed item gets 1.0, lowered to the weight of its worst
    /// unresolved item-level alert.
    pub fn from_alerts<'a, I>(
        item_ids: I,
        alerts: &[DriftAlert],
        run_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a ItemId>,
    {
        let mut weights: BTreeMap<ItemId, f64> =
            item_ids.into_iter().map(|id| (id.clone(), 1.0)).collect();

        for alert in alerts.iter().filter(|a| a.is_unresolved()) {
            let Some(item_id) = alert.item_id.as_ref() else {
                continue;
            };
            let w = Self::weight_for(alert.severity);
            let entry = weights.entry(item_id.clone()).or_insert(1.0);
            *entry = entry.min(w);
        }

        Self {
            version: 0,
            run_id,
            published_at: now,
            weights,
        }
    }

    pub fn weight(&self, item_id: &str) -> f64 {
        self.weights.get(item_id).copied().unwrap_or(1.0)
    }

    /// Items with weight 0, i.e. excluded from selection.
    pub fn excluded(&self) -> Vec<ItemId> {
        self.weights
            .iter()
            .filter(|(_, w)| **w <= 0.0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn to_acceptance_map(&self) -> AcceptanceMap {
        self.weights
            .iter()
            .map(|(id, w)| (id.clone(), *w))
            .collect()
    }
}

struct Published {
    table: Arc<ExposureWeightTable>,
    acceptance: Arc<AcceptanceMap>,
}

/// Latest published exposure table.
///
/// Publishing replaces the whole table. Readers hold the lock only long
/// enough to clone an `Arc`, and may observe a table one version behind.
pub struct ExposureTableHandle {
    current: RwLock<Published>,
}

impl Default for ExposureTableHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ExposureTableHandle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Published {
                table: Arc::new(ExposureWeightTable::empty()),
                acceptance: Arc::new(AcceptanceMap::new()),
            }),
        }
    }

    /// Publish `table`, returning the version it was assigned.
    pub fn publish(&self, mut table: ExposureWeightTable) -> u64 {
        let acceptance = Arc::new(table.to_acceptance_map());
        let mut guard = self.current.write();
        table.version = guard.table.version + 1;
        let version = table.version;
        info!(
            version,
            run_id = table.run_id.as_deref().unwrap_or("-"),
            excluded = table.excluded().len(),
            "exposure table published"
        );
        *guard = Published {
            table: Arc::new(table),
            acceptance,
        };
        version
    }

    pub fn current(&self) -> Arc<ExposureWeightTable> {
        self.current.read().table.clone()
    }
}

impl AcceptanceSource for ExposureTableHandle {
    fn load(&self) -> Result<Arc<AcceptanceMap>> {
        Ok(self.current.read().acceptance.clone())
    }
}
