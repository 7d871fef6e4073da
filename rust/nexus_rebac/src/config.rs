//! Engine configuration.
//!
//! Loaded once at engine construction. Every field has a default, so an empty
//! JSON object is a valid config.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{RebacError, Result};

/// Maximum recursion depth for permission checks.
pub const MAX_DEPTH: u32 = 50;

/// Threshold for parallelization of bulk permission checks.
pub const PERMISSION_PARALLEL_THRESHOLD: usize = 50;

/// Bounds on a single graph evaluation. Exceeding any of them raises
/// `GraphLimitExceeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraphLimits {
    pub max_depth: u32,
    pub max_visited_nodes: u64,
    pub max_duration_ms: u64,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPTH,
            max_visited_nodes: 10_000,
            max_duration_ms: 1_000,
        }
    }
}

impl GraphLimits {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Leopard closure index settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LeopardConfig {
    pub enabled: bool,
    /// Chains longer than this are not indexed. `None` follows `limits.max_depth`.
    pub max_depth: Option<u32>,
    /// Relations that express group membership.
    pub membership_relations: Vec<String>,
    /// Object types that are groups.
    pub group_types: Vec<String>,
}

impl Default for LeopardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: None,
            membership_relations: vec!["member".to_string(), "member-of".to_string()],
            group_types: vec!["group".to_string()],
        }
    }
}

/// Tiger materialized cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TigerConfig {
    pub enabled: bool,
    /// Candidate objects above this count are evaluated live and not cached.
    pub max_working_set: usize,
}

impl Default for TigerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_working_set: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: GraphLimits,
    pub leopard: LeopardConfig,
    pub tiger: TigerConfig,
    pub consistency_timeout_ms: u64,
    /// Extra attempts for idempotent reads on storage errors. Writes never retry.
    pub read_retries: u32,
    pub bulk_parallel_threshold: usize,
    /// Key for the zookie tamper check. Random per instance when absent.
    pub token_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: GraphLimits::default(),
            leopard: LeopardConfig::default(),
            tiger: TigerConfig::default(),
            consistency_timeout_ms: 5_000,
            read_retries: 2,
            bulk_parallel_threshold: PERMISSION_PARALLEL_THRESHOLD,
            token_secret: None,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_depth == 0 {
            return Err(RebacError::Config("limits.max_depth must be > 0".into()));
        }
        if self.limits.max_visited_nodes == 0 {
            return Err(RebacError::Config(
                "limits.max_visited_nodes must be > 0".into(),
            ));
        }
        if self.limits.max_duration_ms == 0 {
            return Err(RebacError::Config("limits.max_duration_ms must be > 0".into()));
        }
        if self.leopard.max_depth == Some(0) {
            return Err(RebacError::Config("leopard.max_depth must be > 0".into()));
        }
        if self.leopard.enabled && self.leopard.membership_relations.is_empty() {
            return Err(RebacError::Config(
                "leopard.membership_relations must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Depth bound for the closure index; never deeper than the evaluator's.
    pub fn leopard_max_depth(&self) -> u32 {
        self.leopard
            .max_depth
            .map_or(self.limits.max_depth, |d| d.min(self.limits.max_depth))
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_millis(self.consistency_timeout_ms)
    }
}
