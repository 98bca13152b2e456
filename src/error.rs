//! Error taxonomy for quota admission.
//!
//! Three operational kinds cross the broker boundary ([`QuotaError::NoManager`],
//! [`QuotaError::OutOfQuota`], [`QuotaError::BackoffLimit`]); everything else is a
//! [`ConfigError`], which is a programmer error and is never retried.
//!
//! Errors reported *by callers* (through grant feedback or `report_error`) are plain data,
//! see [`ReportedError`]. They only ever change throttling and backoff state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T, E = QuotaError> = std::result::Result<T, E>;

/// Errors returned by quota requests.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// Routing error: no manager is registered under this name.
    #[error("No manager with the name {manager_name} found")]
    NoManager { manager_name: String },
    /// Admission denied, either immediately or after waiting in a queue.
    #[error("Ran out of quota for {manager_name}")]
    OutOfQuota {
        manager_name: String,
        /// Name of the rule that blocked the request, if it is named.
        rule: Option<String>,
    },
    /// The manager's backoff was activated more often than its limit allows.
    #[error("Backoff hit the limit of failures for {manager_name}")]
    BackoffLimit { manager_name: String },
    /// Malformed scope, resources, options or rule definitions.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An error kind received over the wire that this crate does not know.
    #[error("{message}")]
    Remote { kind: String, message: String },
}

impl QuotaError {
    pub(crate) fn out_of_quota(manager_name: &str, rule: Option<&str>) -> Self {
        QuotaError::OutOfQuota {
            manager_name: manager_name.to_string(),
            rule: rule.map(str::to_string),
        }
    }

    /// Name of the manager this error refers to, for the three operational kinds.
    pub fn manager_name(&self) -> Option<&str> {
        match self {
            QuotaError::NoManager { manager_name }
            | QuotaError::OutOfQuota { manager_name, .. }
            | QuotaError::BackoffLimit { manager_name } => Some(manager_name),
            _ => None,
        }
    }

    /// Wire `type` tag for this error.
    pub fn kind(&self) -> &str {
        match self {
            QuotaError::NoManager { .. } => "NoManagerError",
            QuotaError::OutOfQuota { .. } => "OutOfQuotaError",
            QuotaError::BackoffLimit { .. } => "BackoffLimitError",
            QuotaError::Config(_) => "ConfigError",
            QuotaError::Remote { kind, .. } => kind,
        }
    }

    pub fn is_out_of_quota(&self) -> bool {
        matches!(self, QuotaError::OutOfQuota { .. })
    }

    pub fn is_backoff_limit(&self) -> bool {
        matches!(self, QuotaError::BackoffLimit { .. })
    }
}

/// Which family of pluggable strategy a registry lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Throttling,
    Queueing,
    Backoff,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Throttling => write!(f, "throttling"),
            StrategyKind::Queueing => write!(f, "queueing"),
            StrategyKind::Backoff => write!(f, "backoff"),
        }
    }
}

/// Validation failures. These fail fast and are never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Please pass a value for the \"{name}\" scope with your quota request")]
    MissingScope { name: String },
    #[error("Please pass only non-empty strings as scope names")]
    EmptyScopeName,
    #[error("Please pass the limit parameter to allow throttling")]
    MissingLimit,
    #[error("Please pass a positive window to the {strategy} throttling")]
    InvalidWindow { strategy: String },
    #[error("Please request a positive amount of \"{resource}\"")]
    InvalidAmount { resource: String },
    #[error("Please pass a number to resources[\"{resource}\"]")]
    MissingResourceAmount { resource: String },
    #[error("Please pass the resource parameter to your rules to allow requesting quota for mixed resource amounts")]
    AmbiguousResources,
    #[error("Please request quota for a selection of the following resources: {}", .resources.join(", "))]
    ResourceSelectionRequired { resources: Vec<String> },
    #[error("Please request quota for at least one of the following resources: {}", .resources.join(", "))]
    NoRelevantRules { resources: Vec<String> },
    #[error("unknown {kind} strategy '{name}'")]
    UnknownStrategy { kind: StrategyKind, name: String },
    #[error("A manager with the name {name} was already added")]
    DuplicateManager { name: String },
    #[error("{0}")]
    InvalidOption(String),
    #[error("a tokio runtime is required to schedule quota timers")]
    MissingRuntime,
    #[error("invalid manager configuration: {0}")]
    Parse(String),
}

/// An error observed by the caller while using granted quota (e.g. an HTTP 429).
///
/// Carried in dismiss feedback and `report_error`; predicates and `on_error` hooks inspect it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl ReportedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl<E: std::error::Error> From<&E> for ReportedError {
    fn from(error: &E) -> Self {
        ReportedError::new(error.to_string())
    }
}

/// Serialized error shape used by remote transports: `{type, message, fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl From<&QuotaError> for WireError {
    fn from(error: &QuotaError) -> Self {
        let mut fields = Map::new();
        if let Some(manager_name) = error.manager_name() {
            fields.insert("managerName".into(), Value::String(manager_name.to_string()));
        }
        if let QuotaError::OutOfQuota { rule: Some(rule), .. } = error {
            fields.insert("rule".into(), Value::String(rule.clone()));
        }
        WireError { kind: error.kind().to_string(), message: error.to_string(), fields }
    }
}

impl From<QuotaError> for WireError {
    fn from(error: QuotaError) -> Self {
        WireError::from(&error)
    }
}

impl WireError {
    /// Restore the typed error. Named kinds round-trip; anything else degrades to
    /// [`QuotaError::Remote`] carrying only the message.
    pub fn into_error(self) -> QuotaError {
        let manager_name = self.fields.get("managerName").and_then(Value::as_str).map(str::to_string);
        match (self.kind.as_str(), manager_name) {
            ("NoManagerError", Some(manager_name)) => QuotaError::NoManager { manager_name },
            ("OutOfQuotaError", Some(manager_name)) => {
                let rule = self.fields.get("rule").and_then(Value::as_str).map(str::to_string);
                QuotaError::OutOfQuota { manager_name, rule }
            }
            ("BackoffLimitError", Some(manager_name)) => QuotaError::BackoffLimit { manager_name },
            _ => QuotaError::Remote { kind: self.kind, message: self.message },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind))
    }
}
