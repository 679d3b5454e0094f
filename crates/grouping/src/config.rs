//! Grouping stage configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Number of increments between two checks of the distinct-key cap.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1_000_000;

/// Minimal count a key needs to survive a prune pass.
pub const DEFAULT_PRUNE_THRESHOLD: u64 = 2;

/// Number of lock shards in a grouping map.
pub const DEFAULT_SHARDS: usize = 64;

/// Name of the field carrying the number of occurrences of a group when
/// [`GroupingConfig::with_count`] is enabled.
pub const COUNT_FIELD: &str = "count";

pub const fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

pub const fn default_prune_threshold() -> u64 {
    DEFAULT_PRUNE_THRESHOLD
}

pub const fn default_shards() -> usize {
    DEFAULT_SHARDS
}

/// Configuration of a grouping stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Fields projected out of each input record to form its group key.
    #[serde(alias = "keyFields")]
    pub key_fields: Vec<String>,

    /// Append a [`COUNT_FIELD`] field with the number of occurrences of each
    /// group to the output.
    #[serde(default, alias = "withCount")]
    pub with_count: bool,

    /// Output the first full record seen for each group instead of the bare
    /// key.
    #[serde(default, alias = "retainOthers")]
    pub retain_others: bool,

    /// Maximal number of distinct keys held before low-count keys get
    /// pruned.  Values `<= 0` disable pruning.
    #[serde(default, alias = "maxTypes")]
    pub max_types: i64,

    /// Keys whose count is below this value are removed by a prune pass.
    #[serde(default = "default_prune_threshold", alias = "pruneThreshold")]
    pub prune_threshold: u64,

    /// Number of increments between two checks of `max_types`.
    #[serde(default = "default_checkpoint_interval", alias = "checkpointInterval")]
    pub checkpoint_interval: u64,

    /// Number of lock shards in the grouping map.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl GroupingConfig {
    pub fn new<I, S>(key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            with_count: false,
            retain_others: false,
            max_types: 0,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            shards: DEFAULT_SHARDS,
        }
    }

    /// Parses and validates a JSON-encoded configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate(None)?;
        Ok(config)
    }

    pub fn with_count(mut self, with_count: bool) -> Self {
        self.with_count = with_count;
        self
    }

    pub fn retain_others(mut self, retain_others: bool) -> Self {
        self.retain_others = retain_others;
        self
    }

    pub fn max_types(mut self, max_types: i64) -> Self {
        self.max_types = max_types;
        self
    }

    pub fn prune_threshold(mut self, prune_threshold: u64) -> Self {
        self.prune_threshold = prune_threshold;
        self
    }

    pub fn checkpoint_interval(mut self, checkpoint_interval: u64) -> Self {
        self.checkpoint_interval = checkpoint_interval;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Distinct-key cap, or `None` if pruning is disabled.
    pub fn max_types_limit(&self) -> Option<usize> {
        (self.max_types > 0).then_some(self.max_types as usize)
    }

    /// Checks the configuration for consistency and, when the upstream
    /// schema is known, checks that every key field exists in it.
    pub fn validate(&self, schema: Option<&[String]>) -> Result<(), ConfigError> {
        if self.key_fields.is_empty() {
            return Err(ConfigError::NoKeyFields);
        }

        let mut seen = HashSet::with_capacity(self.key_fields.len());
        for field in self.key_fields.iter() {
            if field.is_empty() {
                return Err(ConfigError::EmptyFieldName);
            }
            if !seen.insert(field.as_str()) {
                return Err(ConfigError::DuplicateKeyField(field.clone()));
            }
            if let Some(schema) = schema {
                if !schema.iter().any(|name| name == field) {
                    return Err(ConfigError::UnknownKeyField {
                        field: field.clone(),
                        available: schema.to_vec(),
                    });
                }
            }
        }

        if self.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "checkpoint_interval",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.shards == 0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "shards",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_types > 0 && self.prune_threshold < 2 {
            return Err(ConfigError::InvalidParameter {
                parameter: "prune_threshold",
                reason: format!(
                    "must be at least 2 when max_types is set, got {}",
                    self.prune_threshold
                ),
            });
        }

        Ok(())
    }
}
