//! TOML configuration with environment overrides.
//!
//! ```toml
//! [engine]
//! scaling = 1.0
//! scorer = "vectorized"
//! item_bank = "items.json"
//!
//! [policy]
//! top_n = 3
//!
//! [stop]
//! mode = "variable"
//! sem_threshold = 0.3
//!
//! [drift]
//! min_sample = 200
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bank::{ItemSource, JsonItemSource};
use crate::drift::DriftJobConfig;
use crate::engine::CatEngine;
use crate::error::{CatError, Result};
use crate::exposure::JsonFileAcceptance;
use crate::irt::Irt3pl;
use crate::policy::{CatMode, SelectionPolicy, SessionPolicy, StopRulePolicy};
use crate::scoring::ScorerKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scaling constant D inside the logistic.
    pub scaling: f64,
    pub scorer: ScorerKind,
    /// JSON array of items.
    pub item_bank: Option<PathBuf>,
    /// JSON object of acceptance probabilities. Without it the engine uses
    /// the exposure table published by the drift monitor.
    pub acceptance_file: Option<PathBuf>,
    pub cache_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scaling: 1.0,
            scorer: ScorerKind::Scalar,
            item_bank: None,
            acceptance_file: None,
            cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatConfig {
    pub engine: EngineConfig,
    pub policy: SelectionPolicy,
    pub stop: StopRulePolicy,
    pub drift: DriftJobConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CatError::Config(format!("{key}: cannot parse {value:?}")))
}

impl CatConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: CatConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.engine.scaling.is_finite() && self.engine.scaling > 0.0) {
            return Err(CatError::Config("engine.scaling must be positive".into()));
        }
        self.session_policy().validate()?;
        self.drift.validate()
    }

    /// Apply `CAT_*` overrides once, e.g. from `std::env::vars()`. Unknown
    /// keys are ignored; the result is validated again.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "CAT_MODE" => self.stop.mode = value.parse::<CatMode>()?,
                "CAT_MAX_ITEMS" => self.stop.max_items = parse_env(key, value)?,
                "CAT_MIN_ITEMS" => self.stop.min_items = parse_env(key, value)?,
                "CAT_SEM_THRESHOLD" => self.stop.sem_threshold = parse_env(key, value)?,
                "CAT_MAX_TEST_SECONDS" => self.stop.max_test_seconds = Some(parse_env(key, value)?),
                "CAT_MIN_TEST_SECONDS" => self.stop.min_test_seconds = Some(parse_env(key, value)?),
                "CAT_ITEM_COOLDOWN_SECONDS" => {
                    self.stop.item_cooldown_seconds = Some(parse_env(key, value)?)
                }
                "CAT_TOP_N" => self.policy.top_n = parse_env(key, value)?,
                "CAT_EXPOSURE_CAP" => self.policy.exposure_cap = Some(parse_env(key, value)?),
                _ => continue,
            }
            debug!(key, value, "environment override applied");
        }
        self.validate()
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            selection: self.policy.clone(),
            stop: self.stop.clone(),
        }
    }

    pub fn model(&self) -> Irt3pl {
        Irt3pl::new(self.engine.scaling)
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.engine.cache_ttl_seconds)
    }

    pub fn item_source(&self) -> Result<Arc<dyn ItemSource>> {
        let path = self
            .engine
            .item_bank
            .as_ref()
            .ok_or_else(|| CatError::Config("engine.item_bank is not set".into()))?;
        Ok(Arc::new(JsonItemSource::new(path.clone(), self.cache_ttl())))
    }

    /// Engine over `items` with this configuration's model, scorer, default
    /// policy and acceptance file.
    pub fn build_engine(&self, items: Arc<dyn ItemSource>) -> CatEngine {
        let engine = CatEngine::new(items)
            .with_model(self.model())
            .with_scorer(self.engine.scorer.build())
            .with_default_policy(self.session_policy());
        match &self.engine.acceptance_file {
            Some(path) => engine.with_acceptance(Arc::new(JsonFileAcceptance::new(
                path.clone(),
                self.cache_ttl(),
            ))),
            None => engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = CatConfig::from_toml_str("").unwrap();
        assert_eq!(config, CatConfig::default());
        assert_eq!(config.engine.scaling, 1.0);
    }

    #[test]
    fn sections_parse() {
        let config = CatConfig::from_toml_str(
            r#"
            [engine]
            scorer = "vectorized"
            [policy]
            top_n = 2
            avoid_same_topic_hard = true
            [policy.criterion]
            kind = "kl"
            delta = 0.3
            [stop]
            mode = "fixed"
            max_items = 12
            [drift]
            min_sample = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.scorer, ScorerKind::Vectorized);
        assert_eq!(config.policy.top_n, 2);
        assert!(config.policy.avoid_same_topic_hard);
        assert_eq!(config.stop.mode, CatMode::Fixed);
        assert_eq!(config.stop.max_items, 12);
        assert_eq!(config.drift.min_sample, 50);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(CatConfig::from_toml_str("[engine]\nscaling = 0.0").is_err());
        assert!(CatConfig::from_toml_str("[stop]\nmin_items = 50\nmax_items = 10").is_err());
        assert!(matches!(
            CatConfig::from_toml_str("[stop\n"),
            Err(CatError::Toml(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let mut config = CatConfig::default();
        config
            .apply_env_overrides([
                ("CAT_MODE", "FIXED"),
                ("CAT_MAX_ITEMS", "1"),
                ("CAT_MIN_ITEMS", "1"),
                ("CAT_ITEM_COOLDOWN_SECONDS", "5"),
                ("CAT_TOP_N", "1"),
                ("CAT_EXPOSURE_CAP", "100"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.stop.mode, CatMode::Fixed);
        assert_eq!(config.stop.max_items, 1);
        assert_eq!(config.stop.item_cooldown_seconds, Some(5.0));
        assert_eq!(config.policy.top_n, 1);
        assert_eq!(config.policy.exposure_cap, Some(100));

        assert!(config.apply_env_overrides([("CAT_TOP_N", "many")]).is_err());
        assert!(config.apply_env_overrides([("CAT_MODE", "sometimes")]).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[stop]\nsem_threshold = 0.25").unwrap();
        let config = CatConfig::load(file.path()).unwrap();
        assert_eq!(config.stop.sem_threshold, 0.25);
        assert!(config.item_source().is_err());
    }
}
