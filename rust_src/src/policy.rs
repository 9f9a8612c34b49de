//! Per-session policy: item selection constraints and stop rules.
//!
//! A [`SessionPolicy`] is validated once and snapshotted into the session at
//! start; nothing re-reads configuration mid-session.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CatError;
use crate::item::{Item, ItemId};
use crate::scoring::Criterion;

/// How the opening item is ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialItemRule {
    /// Difficulty closest to the starting θ.
    #[default]
    ClosestDifficulty,
    /// Same criterion as every later item.
    Criterion,
}

/// Whether the Sympson-Hetter gate consults the engine's acceptance source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceMode {
    /// Every item is accepted with probability 1.
    Off,
    /// Use the engine's acceptance source (the published exposure table by default).
    #[default]
    Exposure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Candidates kept for the randomized draw.
    pub top_n: usize,
    /// Pool-wide administrations after which an item is withheld.
    pub exposure_cap: Option<u64>,
    /// Per-item caps; override `exposure_cap`.
    pub item_exposure_caps: HashMap<ItemId, u64>,
    /// Number of most recent topics that incur `repeat_penalty`.
    pub avoid_repeat_window: usize,
    /// Fractional weight reduction for a recently seen topic.
    pub repeat_penalty: f64,
    /// Swap away from an item sharing the previous item's topic.
    pub avoid_same_topic_hard: bool,
    /// Relative information advantage that keeps a same-topic item anyway.
    pub same_topic_tolerance: f64,
    /// Target proportion of administered items per topic.
    pub blueprint: BTreeMap<String, f64>,
    /// Boost per unit of blueprint shortfall (capped at +20%).
    pub blueprint_gain: f64,
    pub criterion: Criterion,
    pub initial_item: InitialItemRule,
    pub acceptance: AcceptanceMode,
    /// Allowed topics; empty allows all.
    pub topic_filter: Vec<String>,
    /// Tags an item must carry, all of them.
    pub required_tags: Vec<String>,
    /// Seed for reproducible draws.
    pub seed: Option<u64>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            top_n: 5,
            exposure_cap: None,
            item_exposure_caps: HashMap::new(),
            avoid_repeat_window: 2,
            repeat_penalty: 0.3,
            avoid_same_topic_hard: false,
            same_topic_tolerance: 0.25,
            blueprint: BTreeMap::new(),
            blueprint_gain: 1.0,
            criterion: Criterion::Fisher,
            initial_item: InitialItemRule::ClosestDifficulty,
            acceptance: AcceptanceMode::Exposure,
            topic_filter: Vec::new(),
            required_tags: Vec::new(),
            seed: None,
        }
    }
}

impl SelectionPolicy {
    pub fn validate(&self) -> Result<(), CatError> {
        if self.top_n == 0 {
            return Err(CatError::Config("top_n must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.repeat_penalty) {
            return Err(CatError::Config(format!(
                "repeat_penalty must lie in [0, 1], got {}",
                self.repeat_penalty
            )));
        }
        if !(self.same_topic_tolerance.is_finite() && self.same_topic_tolerance >= 0.0) {
            return Err(CatError::Config(
                "same_topic_tolerance must be non-negative".into(),
            ));
        }
        if !(self.blueprint_gain.is_finite() && self.blueprint_gain >= 0.0) {
            return Err(CatError::Config("blueprint_gain must be non-negative".into()));
        }
        let mut total = 0.0;
        for (topic, &target) in &self.blueprint {
            if !(0.0..=1.0).contains(&target) {
                return Err(CatError::Config(format!(
                    "blueprint target for {topic} must lie in [0, 1], got {target}"
                )));
            }
            total += target;
        }
        if total > 1.0 + 1e-6 {
            return Err(CatError::Config(format!(
                "blueprint targets sum to {total:.3}, more than 1"
            )));
        }
        if let Criterion::Kl { delta } = self.criterion {
            if !(delta.is_finite() && delta != 0.0) {
                return Err(CatError::Config("kl delta must be finite and non-zero".into()));
            }
        }
        Ok(())
    }

    /// Cap for a specific item, per-item override first.
    pub fn cap_for(&self, item_id: &str) -> Option<u64> {
        self.item_exposure_caps
            .get(item_id)
            .copied()
            .or(self.exposure_cap)
    }

    /// Topic/tag prefilter.
    pub fn admits(&self, item: &Item) -> bool {
        let topic_ok = self.topic_filter.is_empty() || self.topic_filter.contains(&item.topic);
        let tags_ok = self
            .required_tags
            .iter()
            .all(|tag| item.tags.contains(tag));
        topic_ok && tags_ok
    }
}

/// Fixed-length or variable-length (SEM-terminated) testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatMode {
    Fixed,
    #[default]
    Variable,
}

impl FromStr for CatMode {
    type Err = CatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(CatMode::Fixed),
            "variable" => Ok(CatMode::Variable),
            other => Err(CatError::Config(format!("unknown CAT mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRulePolicy {
    pub mode: CatMode,
    /// Variable mode stops once SE falls to this value.
    pub sem_threshold: f64,
    pub min_items: usize,
    /// Hard ceiling on test length in both modes.
    pub max_items: usize,
    pub max_test_seconds: Option<f64>,
    /// SEM termination is held back until this much time has elapsed.
    pub min_test_seconds: Option<f64>,
    pub item_cooldown_seconds: Option<f64>,
    /// Ability prior.
    pub prior_mean: f64,
    pub prior_sd: f64,
    /// Largest θ move per answer.
    pub step_cap: f64,
}

impl Default for StopRulePolicy {
    fn default() -> Self {
        Self {
            mode: CatMode::Variable,
            sem_threshold: 0.3,
            min_items: 5,
            max_items: 30,
            max_test_seconds: None,
            min_test_seconds: None,
            item_cooldown_seconds: None,
            prior_mean: 0.0,
            prior_sd: 1.0,
            step_cap: 1.0,
        }
    }
}

impl StopRulePolicy {
    pub fn validate(&self) -> Result<(), CatError> {
        if self.max_items == 0 {
            return Err(CatError::Config("max_items must be at least 1".into()));
        }
        if self.min_items > self.max_items {
            return Err(CatError::Config(format!(
                "min_items ({}) exceeds max_items ({})",
                self.min_items, self.max_items
            )));
        }
        if !(self.sem_threshold.is_finite() && self.sem_threshold > 0.0) {
            return Err(CatError::Config("sem_threshold must be positive".into()));
        }
        if !(self.prior_sd.is_finite() && self.prior_sd > 0.0) {
            return Err(CatError::Config("prior_sd must be positive".into()));
        }
        if !(self.step_cap.is_finite() && self.step_cap > 0.0) {
            return Err(CatError::Config("step_cap must be positive".into()));
        }
        for (name, value) in [
            ("max_test_seconds", self.max_test_seconds),
            ("min_test_seconds", self.min_test_seconds),
            ("item_cooldown_seconds", self.item_cooldown_seconds),
        ] {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(CatError::Config(format!("{name} must be non-negative")));
                }
            }
        }
        Ok(())
    }
}

/// Everything a session needs, snapshotted at start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub selection: SelectionPolicy,
    pub stop: StopRulePolicy,
}

impl SessionPolicy {
    pub fn validate(&self) -> Result<(), CatError> {
        self.selection.validate()?;
        self.stop.validate()
    }

    pub fn fixed_length(max_items: usize) -> Self {
        let mut policy = Self::default();
        policy.stop.mode = CatMode::Fixed;
        policy.stop.max_items = max_items;
        policy.stop.min_items = policy.stop.min_items.min(max_items);
        policy
    }
}
