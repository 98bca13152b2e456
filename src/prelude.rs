//! Convenient re-exports for requesting and returning quota.
pub use crate::{
    backoff::Backoff,
    broker::{Broker, GrantId},
    error::{ConfigError, QuotaError, ReportedError},
    grant::{Feedback, Grant, RuleFeedback},
    manager::Manager,
    middleware::QuotaLayer,
    resources::{RequestOptions, Resources},
    rule::RuleConfig,
    scope::Scope,
};
