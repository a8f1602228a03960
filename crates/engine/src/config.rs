//! Run configuration
//!
//! One `AceConfig` is built at startup (JSON file, then environment, then CLI
//! flags) and passed by reference to every component.

use persistence::{ExperienceStore, PartitionScheme, PlaybookStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::stats::NullHypothesis;

pub const ENV_EXPERIENCE_DIR: &str = "ACE_EXPERIENCE_DIR";
pub const ENV_PLAYBOOK_PATH: &str = "ACE_PLAYBOOK_PATH";

/// Significance filter and ranking parameters for a reflection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Minimum settled bets before a strategy or insight group is considered
    pub min_bets: usize,
    pub max_pvalue: f64,
    /// Bonferroni-correct `max_pvalue` across qualifying strategies
    pub apply_correction: bool,
    pub null_hypothesis: NullHypothesis,
    pub top_strategies: usize,
    pub max_context_insights: usize,
    /// Wilson interval confidence level
    pub confidence_level: f64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            min_bets: 30,
            max_pvalue: 0.05,
            apply_correction: true,
            null_hypothesis: NullHypothesis::default(),
            top_strategies: 10,
            max_context_insights: 20,
            confidence_level: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AceConfig {
    pub experience_dir: PathBuf,
    pub playbook_path: PathBuf,
    pub partition: PartitionScheme,
    /// Playbook snapshots kept in history
    pub max_history: usize,
    pub reflection: ReflectionConfig,
    /// Strategies evaluated in parallel
    pub concurrency: usize,
}

impl Default for AceConfig {
    fn default() -> Self {
        Self {
            experience_dir: PathBuf::from("data/experiences"),
            playbook_path: PathBuf::from("data/playbook.json"),
            partition: PartitionScheme::default(),
            max_history: 10,
            reflection: ReflectionConfig::default(),
            concurrency: 4,
        }
    }
}

impl AceConfig {
    /// Load from a JSON file; absent keys take their defaults.
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: AceConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ACE_EXPERIENCE_DIR` / `ACE_PLAYBOOK_PATH` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_EXPERIENCE_DIR).filter(|v| !v.trim().is_empty()) {
            self.experience_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_PLAYBOOK_PATH).filter(|v| !v.trim().is_empty()) {
            self.playbook_path = PathBuf::from(path);
        }
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        let r = &self.reflection;
        if r.min_bets == 0 {
            return Err(EngineError::Config("min_bets must be >= 1".into()));
        }
        if !(r.max_pvalue > 0.0 && r.max_pvalue < 1.0) {
            return Err(EngineError::Config(format!(
                "max_pvalue must be in (0, 1), got {}",
                r.max_pvalue
            )));
        }
        if !(r.confidence_level > 0.0 && r.confidence_level < 1.0) {
            return Err(EngineError::Config(format!(
                "confidence_level must be in (0, 1), got {}",
                r.confidence_level
            )));
        }
        r.null_hypothesis.validate()?;
        if self.max_history == 0 {
            return Err(EngineError::Config("max_history must be >= 1".into()));
        }
        if self.concurrency == 0 {
            return Err(EngineError::Config("concurrency must be >= 1".into()));
        }
        Ok(())
    }

    pub fn experience_store(&self) -> EngineResult<ExperienceStore> {
        Ok(ExperienceStore::open(&self.experience_dir, self.partition)?)
    }

    pub fn playbook_store(&self) -> PlaybookStore {
        PlaybookStore::new(&self.playbook_path, self.max_history)
    }
}
