//! Granted quota and the feedback returned with it.

use crate::backoff::Backoff;
use crate::bundle::ScopeBundle;
use crate::error::ReportedError;
use crate::rule::Rule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Feedback for a single rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    /// New limit learned from the upstream service (e.g. a rate-limit header).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl RuleFeedback {
    pub fn limit(limit: u64) -> Self {
        Self { error: None, limit: Some(limit) }
    }

    pub fn error(error: ReportedError) -> Self {
        Self { error: Some(error), limit: None }
    }
}

/// Outcome of using a grant. The default value is an unconditional successful release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// Error applying to every rule, and to the manager's backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    /// Overrides keyed by rule name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub for_rule: BTreeMap<String, RuleFeedback>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, error: ReportedError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn for_rule(mut self, rule: impl Into<String>, feedback: RuleFeedback) -> Self {
        self.for_rule.insert(rule.into(), feedback);
        self
    }

    /// Feedback as seen by one rule: the top-level error, overridden by the rule's own entry.
    pub fn rule_feedback(&self, rule: Option<&str>) -> RuleFeedback {
        match rule.and_then(|name| self.for_rule.get(name)) {
            Some(entry) => RuleFeedback {
                error: entry.error.clone().or_else(|| self.error.clone()),
                limit: entry.limit,
            },
            None => RuleFeedback { error: self.error.clone(), limit: None },
        }
    }
}

pub(crate) struct GrantedRule {
    pub(crate) rule: Arc<Rule>,
    pub(crate) bundle: Arc<ScopeBundle>,
    pub(crate) amount: u64,
}

/// Capacity reserved on every relevant rule of one request.
///
/// Dismiss it once the work is done. Dropping an undismissed grant releases it without feedback.
pub struct Grant {
    manager_name: String,
    backoff: Option<Arc<Backoff>>,
    reservations: Vec<GrantedRule>,
    dismissed: bool,
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant")
            .field("manager_name", &self.manager_name)
            .field("rules", &self.reservations.len())
            .field("dismissed", &self.dismissed)
            .finish()
    }
}

impl Grant {
    pub(crate) fn new(
        manager_name: String,
        backoff: Option<Arc<Backoff>>,
        reservations: Vec<GrantedRule>,
    ) -> Self {
        trace!(manager = %manager_name, rules = reservations.len(), "grant issued");
        Self { manager_name, backoff, reservations, dismissed: false }
    }

    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    /// Names of the rules this grant reserved capacity on (unnamed rules yield `None`).
    pub fn rule_names(&self) -> Vec<Option<&str>> {
        self.reservations.iter().map(|r| r.rule.name()).collect()
    }

    /// Release the reserved capacity and report what happened.
    pub fn dismiss(mut self, feedback: Feedback) {
        self.dismiss_with(&feedback);
    }

    /// Release without feedback.
    pub fn release(self) {
        self.dismiss(Feedback::default());
    }

    fn dismiss_with(&mut self, feedback: &Feedback) {
        if std::mem::replace(&mut self.dismissed, true) {
            return;
        }
        if let (Some(error), Some(backoff)) = (&feedback.error, &self.backoff) {
            backoff.activate(error);
        }
        for granted in self.reservations.drain(..) {
            let rule_feedback = feedback.rule_feedback(granted.rule.name());
            granted.bundle.release(granted.amount, &rule_feedback);
        }
        trace!(manager = %self.manager_name, error = feedback.error.is_some(), "grant dismissed");
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if !self.dismissed {
            self.dismiss_with(&Feedback::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_entry_overrides_top_level() {
        let top = ReportedError::new("top");
        let own = ReportedError::new("own");
        let feedback = Feedback::new()
            .with_error(top.clone())
            .for_rule("a", RuleFeedback::limit(5))
            .for_rule("b", RuleFeedback::error(own.clone()));

        assert_eq!(feedback.rule_feedback(Some("a")), RuleFeedback { error: Some(top.clone()), limit: Some(5) });
        assert_eq!(feedback.rule_feedback(Some("b")), RuleFeedback { error: Some(own), limit: None });
        assert_eq!(feedback.rule_feedback(Some("c")), RuleFeedback::error(top.clone()));
        assert_eq!(feedback.rule_feedback(None), RuleFeedback::error(top));
    }

    #[test]
    fn empty_feedback_is_a_plain_release() {
        assert_eq!(Feedback::default().rule_feedback(Some("a")), RuleFeedback::default());
    }

    #[test]
    fn feedback_deserializes_camel_case() {
        let feedback: Feedback =
            serde_json::from_str(r#"{"error":{"message":"429","status":429},"forRule":{"main":{"limit":2}}}"#)
                .unwrap();
        assert_eq!(feedback.error.as_ref().and_then(|e| e.status), Some(429));
        assert_eq!(feedback.for_rule["main"].limit, Some(2));
    }
}
