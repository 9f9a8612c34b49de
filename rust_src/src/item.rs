//! Item bank records and validated 3PL parameters.

use serde::{Deserialize, Serialize};

use crate::error::{CatError, ParameterError};

pub type ItemId = String;

/// Validated 3PL parameters: `a > 0`, finite `b`, `0 <= c < 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParams")]
pub struct ItemParams {
    a: f64,
    b: f64,
    c: f64,
}

#[derive(Deserialize)]
struct RawParams {
    a: f64,
    b: f64,
    #[serde(default)]
    c: f64,
}

impl TryFrom<RawParams> for ItemParams {
    type Error = ParameterError;

    fn try_from(raw: RawParams) -> Result<Self, Self::Error> {
        ItemParams::new(raw.a, raw.b, raw.c)
    }
}

impl ItemParams {
    pub fn new(a: f64, b: f64, c: f64) -> Result<Self, ParameterError> {
        if !(a.is_finite() && a > 0.0) {
            return Err(ParameterError::Discrimination(a));
        }
        if !b.is_finite() {
            return Err(ParameterError::Difficulty(b));
        }
        if !(c.is_finite() && (0.0..1.0).contains(&c)) {
            return Err(ParameterError::Guessing(c));
        }
        Ok(Self { a, b, c })
    }

    #[inline]
    pub fn a(&self) -> f64 {
        self.a
    }

    #[inline]
    pub fn b(&self) -> f64 {
        self.b
    }

    #[inline]
    pub fn c(&self) -> f64 {
        self.c
    }
}

/// One item of the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ItemRecord", into = "ItemRecord")]
pub struct Item {
    pub id: ItemId,
    pub params: ItemParams,
    pub topic: String,
    pub tags: Vec<String>,
    pub anchor: bool,
    pub exposure_count: u64,
}

/// Flat wire form of an [`Item`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub a: f64,
    pub b: f64,
    #[serde(default)]
    pub c: f64,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub anchor: bool,
    #[serde(default)]
    pub exposure_count: u64,
}

impl TryFrom<ItemRecord> for Item {
    type Error = CatError;

    fn try_from(rec: ItemRecord) -> Result<Self, Self::Error> {
        let params = ItemParams::new(rec.a, rec.b, rec.c).map_err(|source| CatError::Parameter {
            item_id: rec.id.clone(),
            source,
        })?;
        Ok(Item {
            id: rec.id,
            params,
            topic: rec.topic,
            tags: rec.tags,
            anchor: rec.anchor,
            exposure_count: rec.exposure_count,
        })
    }
}

impl From<Item> for ItemRecord {
    fn from(item: Item) -> Self {
        ItemRecord {
            id: item.id,
            a: item.params.a,
            b: item.params.b,
            c: item.params.c,
            topic: item.topic,
            tags: item.tags,
            anchor: item.anchor,
            exposure_count: item.exposure_count,
        }
    }
}

impl Item {
    pub fn new(
        id: impl Into<ItemId>,
        a: f64,
        b: f64,
        c: f64,
        topic: impl Into<String>,
    ) -> Result<Self, CatError> {
        let id = id.into();
        let params = ItemParams::new(a, b, c).map_err(|source| CatError::Parameter {
            item_id: id.clone(),
            source,
        })?;
        Ok(Item {
            id,
            params,
            topic: topic.into(),
            tags: Vec::new(),
            anchor: false,
            exposure_count: 0,
        })
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn as_anchor(mut self) -> Self {
        self.anchor = true;
        self
    }

    /// Public view handed to callers (no exposure bookkeeping).
    pub fn view(&self) -> ItemView {
        ItemView {
            id: self.id.clone(),
            topic: self.topic.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// What the outer application needs to render the next item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    pub id: ItemId,
    pub topic: String,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            ItemParams::new(0.0, 0.0, 0.2),
            Err(ParameterError::Discrimination(0.0))
        );
        assert_eq!(
            ItemParams::new(-1.0, 0.0, 0.2),
            Err(ParameterError::Discrimination(-1.0))
        );
        assert_eq!(
            ItemParams::new(1.0, 0.0, 1.0),
            Err(ParameterError::Guessing(1.0))
        );
        assert_eq!(
            ItemParams::new(1.0, 0.0, -0.1),
            Err(ParameterError::Guessing(-0.1))
        );
        assert!(ItemParams::new(1.0, f64::NAN, 0.0).is_err());
        assert!(ItemParams::new(1.0, 0.0, 0.0).is_ok());
    }

    #[test]
    fn deserializes_flat_record() {
        let item: Item = serde_json::from_str(
            r#"{"id":"q1","a":1.2,"b":-0.5,"c":0.2,"topic":"algebra","tags":["t1"]}"#,
        )
        .unwrap();
        assert_eq!(item.id, "q1");
        assert_eq!(item.params.a(), 1.2);
        assert_eq!(item.topic, "algebra");
        assert!(!item.anchor);

        let round: ItemRecord = item.clone().into();
        assert_eq!(round.c, 0.2);
    }

    #[test]
    fn deserialization_fails_fast_on_bad_params() {
        let err = serde_json::from_str::<Item>(r#"{"id":"q1","a":0.0,"b":0.0}"#).unwrap_err();
        assert!(err.to_string().contains("q1"));
    }
}
