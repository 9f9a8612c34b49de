//! Computerized adaptive testing engine.
//!
//! This crate provides:
//! - 3PL IRT kernel: probability, Fisher and KL information, MAP/MLE/EAP ability estimates
//! - Batch item scoring (scalar, ndarray-vectorized, rayon-parallel)
//! - Constrained next-item selection with exposure control and content balancing
//! - Per-session stop-rule state machine
//! - Windowed recalibration, drift and DIF detection with exposure-weight publication
//! - Monte-Carlo CAT simulation

pub mod utils;

pub mod bank;
pub mod cache;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod dif;
pub mod drift;
pub mod engine;
pub mod error;
pub mod exposure;
pub mod irt;
pub mod item;
pub mod policy;
pub mod repository;
pub mod scoring;
pub mod selector;
pub mod session;
pub mod simulation;
pub mod store;
pub mod window;

pub use bank::{ItemSource, JsonItemSource, StaticItemSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CatConfig;
pub use drift::{DriftAlert, DriftJobConfig, DriftMonitor, DriftReport, Severity};
pub use engine::CatEngine;
pub use error::{CatError, ParameterError, Result};
pub use exposure::{ExposureTableHandle, ExposureWeightTable};
pub use irt::{AbilityEstimate, Irt3pl};
pub use item::{Item, ItemId, ItemParams, ItemView};
pub use policy::{CatMode, SelectionPolicy, SessionPolicy, StopRulePolicy};
pub use scoring::{BatchScorer, Criterion, ScorerKind};
pub use selector::{SelectionOutcome, Selector};
pub use session::{AnswerRequest, AnswerResponse, SessionState, TerminationReason};
pub use window::{ResponseRecord, Window};
