//! Item bank sources.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::error::{CatError, Result};
use crate::item::{Item, ItemRecord};

pub trait ItemSource: Send + Sync {
    fn load_items(&self) -> Result<Arc<Vec<Item>>>;
}

/// Rejects empty pools and duplicate ids.
pub fn validate_pool(items: &[Item]) -> Result<()> {
    if items.is_empty() {
        return Err(CatError::Config("item pool is empty".into()));
    }
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.id.as_str()) {
            return Err(CatError::Config(format!("duplicate item id {}", item.id)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StaticItemSource {
    items: Arc<Vec<Item>>,
}

impl StaticItemSource {
    pub fn new(items: Vec<Item>) -> Result<Self> {
        validate_pool(&items)?;
        Ok(Self {
            items: Arc::new(items),
        })
    }
}

impl ItemSource for StaticItemSource {
    fn load_items(&self) -> Result<Arc<Vec<Item>>> {
        Ok(self.items.clone())
    }
}

/// JSON array of item records on disk, re-read after the TTL.
pub struct JsonItemSource {
    path: PathBuf,
    cache: TtlCache<Vec<Item>>,
}

impl JsonItemSource {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            cache: TtlCache::new("item_bank", ttl),
        }
    }

    /// Records with invalid parameters are dropped; the rest of the bank loads.
    pub fn read(path: &Path) -> Result<Vec<Item>> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<ItemRecord> = serde_json::from_str(&raw)?;
        let total = records.len();
        let items: Vec<Item> = records
            .into_iter()
            .filter_map(|rec| match Item::try_from(rec) {
                Ok(item) => Some(item),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "item rejected");
                    None
                }
            })
            .collect();
        validate_pool(&items)?;
        debug!(
            path = %path.display(),
            items = items.len(),
            rejected = total - items.len(),
            "item bank loaded"
        );
        Ok(items)
    }
}

impl ItemSource for JsonItemSource {
    fn load_items(&self) -> Result<Arc<Vec<Item>>> {
        self.cache.get_or_load(|| Self::read(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn duplicate_ids_are_rejected() {
        let q = Item::new("q1", 1.0, 0.0, 0.2, "t").unwrap();
        assert!(StaticItemSource::new(vec![q.clone(), q]).is_err());
        assert!(StaticItemSource::new(Vec::new()).is_err());
    }

    #[test]
    fn reads_json_bank() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "q1", "a": 1.2, "b": -0.5, "c": 0.2, "topic": "algebra", "anchor": true}},
                {{"id": "q2", "a": 0.9, "b": 1.0, "topic": "geometry", "tags": ["g8"]}}
            ]"#
        )
        .unwrap();
        let source = JsonItemSource::new(file.path(), Duration::from_secs(60));
        let items = source.load_items().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].anchor);
        assert_eq!(items[1].params.c(), 0.0);
        assert_eq!(items[1].tags, vec!["g8".to_string()]);
    }

    #[test]
    fn invalid_records_are_dropped_and_the_rest_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "good", "a": 1.1, "b": 0.2, "c": 0.1, "topic": "algebra"}},
                {{"id": "bad", "a": -1.0, "b": 0.0}},
                {{"id": "lucky", "a": 0.8, "b": 0.0, "c": 1.0}}
            ]"#
        )
        .unwrap();
        let items = JsonItemSource::read(file.path()).unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[test]
    fn bank_with_no_valid_items_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"id": "q1", "a": -1.0, "b": 0.0}}]"#).unwrap();
        assert!(matches!(
            JsonItemSource::read(file.path()),
            Err(CatError::Config(_))
        ));
    }

    #[test]
    fn rejected_record_names_its_item() {
        let rec = ItemRecord {
            id: "bad".into(),
            a: -1.0,
            b: 0.0,
            c: 0.0,
            topic: String::new(),
            tags: Vec::new(),
            anchor: false,
            exposure_count: 0,
        };
        match Item::try_from(rec) {
            Err(CatError::Parameter { item_id, .. }) => assert_eq!(item_id, "bad"),
            other => panic!("expected parameter error, got {other:?}"),
        }
    }
}
