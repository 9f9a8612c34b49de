//! Calibration windows and the response records they select.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CatError, Result};
use crate::item::ItemId;

/// A half-open time range `[start, end)` with optional population filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: String,
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Group column → required value.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl Window {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        let id = id.into();
        if start >= end {
            return Err(CatError::Config(format!(
                "window {id} must start before it ends"
            )));
        }
        Ok(Self {
            id,
            label: label.into(),
            start,
            end,
            filters: BTreeMap::new(),
        })
    }

    /// The `days` days ending at `now`.
    pub fn trailing(id: impl Into<String>, now: DateTime<Utc>, days: u32) -> Result<Self> {
        let start = now - TimeDelta::days(i64::from(days));
        Self::new(id, format!("last {days} days"), start, now)
    }

    pub fn with_filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(column.into(), value.into());
        self
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn admits(&self, record: &ResponseRecord) -> bool {
        self.contains(record.answered_at)
            && self
                .filters
                .iter()
                .all(|(col, value)| record.groups.get(col) == Some(value))
    }
}

/// One scored response, as fed to calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub person_id: String,
    pub item_id: ItemId,
    pub correct: bool,
    /// Ability estimate of the person when the item was answered.
    pub theta: f64,
    pub answered_at: DateTime<Utc>,
    /// Subgroup attributes (column → value) used for filters and DIF.
    #[serde(default)]
    pub groups: BTreeMap<String, String>,
}

impl ResponseRecord {
    pub fn new(
        person_id: impl Into<String>,
        item_id: impl Into<ItemId>,
        correct: bool,
        theta: f64,
        answered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            person_id: person_id.into(),
            item_id: item_id.into(),
            correct,
            theta,
            answered_at,
            groups: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.groups.insert(column.into(), value.into());
        self
    }
}

pub trait ResponseSource: Send + Sync {
    /// Every response the window admits.
    fn responses(&self, window: &Window) -> Result<Vec<ResponseRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryResponses {
    records: RwLock<Vec<ResponseRecord>>,
}

impl InMemoryResponses {
    pub fn new(records: Vec<ResponseRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn push(&self, record: ResponseRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ResponseSource for InMemoryResponses {
    fn responses(&self, window: &Window) -> Result<Vec<ResponseRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| window.admits(r))
            .cloned()
            .collect())
    }
}

/// JSON array of [`ResponseRecord`] on disk.
pub struct JsonResponseFile {
    path: std::path::PathBuf,
}

impl JsonResponseFile {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResponseSource for JsonResponseFile {
    fn responses(&self, window: &Window) -> Result<Vec<ResponseRecord>> {
        let raw = std::fs::read_to_string(&self.path)?;
        let records: Vec<ResponseRecord> = serde_json::from_str(&raw)?;
        Ok(records.into_iter().filter(|r| window.admits(r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    #[test]
    fn window_is_half_open() {
        let w = Window::new("w", "w", at(10), at(20)).unwrap();
        assert!(!w.contains(at(9)));
        assert!(w.contains(at(10)));
        assert!(w.contains(at(19)));
        assert!(!w.contains(at(20)));
        assert!(Window::new("bad", "bad", at(20), at(20)).is_err());
    }

    #[test]
    fn trailing_window_ends_now() {
        let now = at(30 * 86_400);
        let w = Window::trailing("recent", now, 30).unwrap();
        assert_eq!(w.start, at(0));
        assert!(!w.contains(now));
    }

    #[test]
    fn filters_restrict_population() {
        let w = Window::new("w", "w", at(0), at(100))
            .unwrap()
            .with_filter("region", "north");
        let source = InMemoryResponses::new(vec![
            ResponseRecord::new("p1", "q1", true, 0.0, at(5)).with_group("region", "north"),
            ResponseRecord::new("p2", "q1", false, 0.0, at(5)).with_group("region", "south"),
            ResponseRecord::new("p3", "q1", false, 0.0, at(5)),
            ResponseRecord::new("p4", "q1", true, 0.0, at(500)).with_group("region", "north"),
        ]);
        let got = source.responses(&w).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].person_id, "p1");
    }

    #[test]
    fn reads_records_from_json() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let recs = vec![ResponseRecord::new("p1", "q1", true, 0.5, at(5))];
        write!(file, "{}", serde_json::to_string(&recs).unwrap()).unwrap();
        let w = Window::new("w", "w", at(0), at(10)).unwrap();
        let got = JsonResponseFile::new(file.path()).responses(&w).unwrap();
        assert_eq!(got, recs);
    }
}
