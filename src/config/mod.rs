use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::filter::{MatchRule, TagPredicate};

/// Inputs at or above this size default to the dense location index.
pub const DENSE_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;
/// Starting slot count of a dense location index (128 MiB of sparse file).
pub const DEFAULT_INITIAL_NODES: u64 = 1 << 24;
pub const GENERATOR: &str = concat!("highclip ", env!("CARGO_PKG_VERSION"));

/// Optional YAML configuration (`--filters`).
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub filter: PredicateConfig,
    pub boundary: BoundaryConfig,
    pub clip: ClipConfig,
}

impl FiltersConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PredicateConfig {
    pub default: DefaultAction,
    pub invert: bool,
    pub rules: Vec<RuleConfig>,
}

impl PredicateConfig {
    /// Build the predicate. Without rules the built-in highway list stands in
    /// for them; `default` and `invert` apply either way.
    pub fn build(&self) -> TagPredicate {
        let predicate = TagPredicate::new(self.default == DefaultAction::Deny);
        let predicate = if self.rules.is_empty() {
            predicate.with_rules(TagPredicate::highways().rules().iter().cloned())
        } else {
            predicate.with_rules(self.rules.iter().flat_map(RuleConfig::to_rules))
        };
        predicate.with_invert(self.invert)
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Accept,
    #[default]
    Deny,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RuleConfig {
    pub tag: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

impl RuleConfig {
    fn to_rules(&self) -> Vec<MatchRule> {
        let values: Vec<&str> = self
            .value
            .iter()
            .chain(self.values.iter())
            .map(String::as_str)
            .collect();
        if values.is_empty() || values.contains(&"*") {
            return vec![MatchRule::any(&self.tag)];
        }
        values
            .into_iter()
            .map(|value| MatchRule::exact(&self.tag, value))
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Attribute names tried in order, compared case-insensitively.
    pub name_fields: Vec<String>,
    pub missing_name: MissingNamePolicy,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            name_fields: vec![
                "name".to_string(),
                "forestname".to_string(),
                "unit_name".to_string(),
            ],
            missing_name: MissingNamePolicy::Fail,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissingNamePolicy {
    #[default]
    Fail,
    /// Name the region `region-<feature index>`
    Synthesize,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClipConfig {
    pub policy: ClipPolicy,
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ClipPolicy {
    /// Keep a way when at least one node lies inside
    #[default]
    Any,
    /// Keep a way only when every node lies inside
    All,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RuntimeConfig {
    pub node_cache_mode: NodeCacheMode,
    /// Keep the dense index at this path instead of a temp file
    pub node_cache_path: Option<PathBuf>,
    pub node_cache_initial_nodes: u64,
    pub generator: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_cache_mode: NodeCacheMode::Auto,
            node_cache_path: None,
            node_cache_initial_nodes: DEFAULT_INITIAL_NODES,
            generator: GENERATOR.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeCacheMode {
    Auto,
    Sparse,
    Dense,
    Memory,
}

impl NodeCacheMode {
    pub fn label(&self) -> &'static str {
        match self {
            NodeCacheMode::Auto => "auto",
            NodeCacheMode::Sparse => "sparse",
            NodeCacheMode::Dense => "dense",
            NodeCacheMode::Memory => "memory",
        }
    }

    /// Resolve `auto` by input size, everything else stays as requested.
    pub fn resolve(self, input_size: u64) -> NodeCacheMode {
        match self {
            NodeCacheMode::Auto if input_size >= DENSE_THRESHOLD_BYTES => NodeCacheMode::Dense,
            NodeCacheMode::Auto => NodeCacheMode::Sparse,
            requested => requested,
        }
    }
}
