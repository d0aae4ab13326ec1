use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::event::DEFAULT_EVENT_CAPACITY;
use crate::types::Policy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub merge: MergePolicy,
    /// Ceilings for states created with [`EngineConfig::new_state`].
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Used when a graph does not set its own limit.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default)]
    pub condition_errors: ConditionErrorStrategy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            checkpoint_interval: default_checkpoint_interval(),
            condition_errors: ConditionErrorStrategy::default(),
        }
    }
}

fn default_max_steps() -> usize { 50 }
fn default_checkpoint_interval() -> usize { 1 }

/// Per-node retry backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Scale each delay by a random factor in 1.0..1.2.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff(),
            jitter: false,
        }
    }
}

fn default_base_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { DEFAULT_EVENT_CAPACITY }

/// Order in which parallel branch results are folded together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Branch order as declared on the parallel edge.
    #[default]
    Defined,
    /// Alphabetical by node id.
    #[serde(alias = "sorted")]
    SortedById,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LastWriteWins,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    #[serde(default)]
    pub order: MergeOrder,
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

/// What to do when an edge predicate returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionErrorStrategy {
    /// Fail the run with the predicate's error.
    #[default]
    Fail,
    /// Log and treat the edge as not taken.
    Skip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_node_start: Vec<String>,
    #[serde(default)]
    pub on_node_end: Vec<String>,
    #[serde(default)]
    pub on_error: Vec<String>,
    #[serde(default)]
    pub on_checkpoint: Vec<String>,
    #[serde(default)]
    pub on_budget_warning: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_node_start.is_empty()
            && self.on_node_end.is_empty()
            && self.on_error.is_empty()
            && self.on_checkpoint.is_empty()
            && self.on_budget_warning.is_empty()
    }
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.runner.checkpoint_interval == 0 {
            return Err(TrellisError::Config(
                "runner.checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.runner.max_steps == 0 {
            return Err(TrellisError::Config("runner.max_steps must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(TrellisError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.events.capacity == 0 {
            return Err(TrellisError::Config("events.capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// A fresh run state carrying this config's policy.
    pub fn new_state(&self) -> crate::types::State {
        crate::types::State::new(self.policy.clone())
    }
}

/// Expand `${VAR}` references. Unknown variables expand to "".
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            result.push_str(&std::env::var(&var_name).unwrap_or_default());
        } else {
            result.push(c);
        }
    }

    result
}
