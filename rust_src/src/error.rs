//! Error types.

use thiserror::Error;

use crate::item::ItemId;

/// Invalid 3PL parameters at the kernel boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("discrimination must be positive and finite, got {0}")]
    Discrimination(f64),
    #[error("difficulty must be finite, got {0}")]
    Difficulty(f64),
    #[error("guessing must lie in [0, 1), got {0}")]
    Guessing(f64),
}

#[derive(Debug, Error)]
pub enum CatError {
    #[error("invalid parameters for item {item_id}: {source}")]
    Parameter {
        item_id: ItemId,
        #[source]
        source: ParameterError,
    },

    #[error("no selectable items remain in the pool")]
    NoSelectableItems,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("unknown item {0}")]
    UnknownItem(ItemId),

    #[error("item {item_id} was already answered in session {session_id}")]
    DuplicateResponse { session_id: String, item_id: ItemId },

    #[error("item {item_id} has {n} responses, {min} required")]
    InsufficientSample { item_id: ItemId, n: usize, min: usize },

    #[error("unknown window {0}")]
    UnknownWindow(String),

    #[error("calibration failed for item {item_id}: {reason}")]
    Calibration { item_id: ItemId, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CatError>;
