//! Declarative manager definitions.
//!
//! Durations are milliseconds. Strategies are referenced by their registry key, either as a
//! plain string or as an object with a `type` field and the strategy's parameters:
//!
//! ```rust
//! use quotaflow::ManagerConfig;
//!
//! let config = ManagerConfig::from_json(r#"{
//!     "label": "echonest",
//!     "backoff": { "type": "timeout", "delay": 2000 },
//!     "rules": [
//!         { "name": "main", "throttling": { "type": "window-sliding", "limit": 120, "window": 60000 },
//!           "queueing": "fifo" },
//!         { "throttling": "limit-concurrency", "limit": 10, "scope": "apiKey" }
//!     ]
//! }"#).unwrap();
//! assert_eq!(config.rules.len(), 2);
//! ```

use crate::error::ConfigError;
use crate::manager::Manager;
use crate::registry::{self, BackoffOptions, StrategyRegistry};
use crate::rule::{Rule, RuleConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<StrategySpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "ScopeSpec::is_empty")]
    pub scope: ScopeSpec,
    pub throttling: StrategySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queueing: Option<StrategySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u64>,
}

/// A single scope dimension or an ordered list of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeSpec {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl ScopeSpec {
    fn is_empty(&self) -> bool {
        matches!(self, ScopeSpec::None)
    }

    pub fn dimensions(&self) -> Vec<String> {
        match self {
            ScopeSpec::None => Vec::new(),
            ScopeSpec::One(name) => vec![name.clone()],
            ScopeSpec::Many(names) => names.clone(),
        }
    }
}

/// Reference to a registered strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrategySpec {
    Name(String),
    Detailed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        /// Window for throttlings, delay for backoffs; milliseconds.
        #[serde(default, alias = "delay", skip_serializing_if = "Option::is_none")]
        window: Option<u64>,
    },
}

impl StrategySpec {
    pub fn kind(&self) -> &str {
        match self {
            StrategySpec::Name(kind) | StrategySpec::Detailed { kind, .. } => kind,
        }
    }

    fn limit(&self) -> Option<u64> {
        match self {
            StrategySpec::Detailed { limit, .. } => *limit,
            StrategySpec::Name(_) => None,
        }
    }

    fn millis(&self) -> Option<Duration> {
        match self {
            StrategySpec::Detailed { window, .. } => window.map(Duration::from_millis),
            StrategySpec::Name(_) => None,
        }
    }
}

impl RuleSpec {
    /// Parameters on the strategy object win over the ones on the rule.
    pub fn to_rule_config(&self) -> RuleConfig {
        let mut config = RuleConfig::new(self.throttling.kind()).scope(self.scope.dimensions());
        if let Some(name) = &self.name {
            config = config.name(name.clone());
        }
        if let Some(resource) = &self.resource {
            config = config.resource(resource.clone());
        }
        if let Some(limit) = self.throttling.limit().or(self.limit) {
            config = config.limit(limit);
        }
        if let Some(window) = self.throttling.millis().or(self.window.map(Duration::from_millis)) {
            config = config.window(window);
        }
        if let Some(queueing) = &self.queueing {
            config = config.queueing(queueing.kind());
        }
        config
    }
}

impl ManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn build(&self) -> Result<Manager, ConfigError> {
        self.build_with(registry::global())
    }

    /// Resolve every strategy through `registry`. Fails on the first invalid rule.
    pub fn build_with(&self, registry: &StrategyRegistry) -> Result<Manager, ConfigError> {
        let mut builder = Manager::builder();
        if let Some(label) = &self.label {
            builder = builder.label(label.clone());
        }
        if let Some(backoff) = &self.backoff {
            let limit = backoff
                .limit()
                .map(|limit| {
                    u32::try_from(limit)
                        .map_err(|_| ConfigError::InvalidOption(format!("backoff limit {limit} is too large")))
                })
                .transpose()?;
            let options = BackoffOptions { delay: backoff.millis(), limit: limit.map(Some) };
            builder = builder.backoff(registry.backoff(backoff.kind(), &options)?);
        }
        for spec in &self.rules {
            builder = builder.add_rule(Rule::with_registry(spec.to_rule_config(), registry)?);
        }
        builder.build()
    }
}

impl Manager {
    /// Build a manager from a declarative definition using the global registry.
    pub fn from_config(config: &ManagerConfig) -> Result<Manager, ConfigError> {
        config.build()
    }
}
