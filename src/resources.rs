//! Requested amounts and per-request options.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How much of which resource a request consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resources {
    /// One unit of the manager's only resource.
    #[default]
    Default,
    /// An amount of the manager's only resource.
    Amount(u64),
    /// Amounts per resource name; selects which rules apply.
    Named(BTreeMap<String, u64>),
}

impl Resources {
    pub fn amount(amount: u64) -> Self {
        Resources::Amount(amount)
    }

    pub fn named<K: Into<String>>(entries: impl IntoIterator<Item = (K, u64)>) -> Self {
        Resources::Named(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Resources::Named(_))
    }

    /// Resource names, for named requests.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let names = match self {
            Resources::Named(map) => Some(map.keys().map(String::as_str)),
            _ => None,
        };
        names.into_iter().flatten()
    }

    /// Amount a rule limiting `rule_resource` has to reserve for this request.
    pub fn amount_for(&self, rule_resource: Option<&str>) -> Result<u64, ConfigError> {
        let (name, amount) = match self {
            Resources::Default => return Ok(1),
            Resources::Amount(amount) => (rule_resource.unwrap_or("default"), Some(*amount)),
            Resources::Named(map) => {
                let name = match rule_resource {
                    Some(name) => name,
                    None => {
                        let mut names = map.keys();
                        match (names.next(), names.next()) {
                            (None, _) => return Ok(1),
                            (Some(only), None) => only.as_str(),
                            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousResources),
                        }
                    }
                };
                (name, map.get(name).copied())
            }
        };
        match amount {
            None => Err(ConfigError::MissingResourceAmount { resource: name.to_string() }),
            Some(0) => Err(ConfigError::InvalidAmount { resource: name.to_string() }),
            Some(amount) => Ok(amount),
        }
    }
}

/// Options of one quota request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Upper bound for waiting in queues, measured from the first time the request queues.
    /// `Some(Duration::ZERO)` never waits.
    pub max_wait: Option<Duration>,
}

impl RequestOptions {
    pub fn max_wait(max_wait: Duration) -> Self {
        Self { max_wait: Some(max_wait) }
    }
}
