//! Multi-rule admission.
//!
//! A [`Manager`] owns the rules of one logical resource namespace (e.g. one third-party API)
//! and an optional [`Backoff`]. `request_quota` walks the relevant rules in declaration order:
//!
//! 1. wait out an active backoff;
//! 2. lock the bundles of every relevant rule (ascending bundle id) and check them all;
//! 3. if all admit, reserve on all of them while still holding the locks and return a [`Grant`];
//! 4. otherwise queue on the first rule that does not admit, wait to be woken, and start over.
//!
//! Nothing is reserved until every rule admits, so an abandoned walk never leaves partial
//! reservations behind. A request re-queued on the rule it was just woken from goes back to
//! the front of that queue, so later arrivals can not overtake it.
//!
//! ```rust
//! use quotaflow::{Manager, RuleConfig, Resources, RequestOptions, Scope, Feedback};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), quotaflow::QuotaError> {
//! let manager = Manager::builder()
//!     .label("search-api")
//!     .rule(RuleConfig::new("limit-concurrency").limit(2).queueing("fifo"))
//!     .build()?;
//!
//! let grant = manager
//!     .request_quota(&Scope::new(), &Resources::Default, &RequestOptions::default())
//!     .await?;
//! // ... call the API ...
//! grant.dismiss(Feedback::default());
//! # Ok(())
//! # }
//! ```

use crate::backoff::Backoff;
use crate::bundle::{BundleState, ScopeBundle};
use crate::error::{ConfigError, QuotaError, ReportedError, Result};
use crate::grant::{Grant, GrantedRule};
use crate::queued_request::QueuedRequest;
use crate::resources::{RequestOptions, Resources};
use crate::rule::{Rule, RuleConfig};
use crate::scope::Scope;
use std::fmt;
use std::sync::{Arc, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

const DEFAULT_LABEL: &str = "manager";

pub struct Manager {
    label: String,
    rules: Vec<Arc<Rule>>,
    resources: Vec<String>,
    backoff: Option<Arc<Backoff>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("label", &self.label)
            .field("rules", &self.rules)
            .field("resources", &self.resources)
            .field("backoff", &self.backoff)
            .finish()
    }
}

enum RuleEntry {
    Built(Arc<Rule>),
    Config(Box<RuleConfig>),
}

/// Builder for [`Manager`]. Rules keep the order they were added in.
#[derive(Default)]
pub struct ManagerBuilder {
    label: Option<String>,
    rules: Vec<RuleEntry>,
    backoff: Option<Backoff>,
}

impl ManagerBuilder {
    /// Name used in errors and logs when the manager is not addressed through a broker.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn rule(mut self, config: RuleConfig) -> Self {
        self.rules.push(RuleEntry::Config(Box::new(config)));
        self
    }

    pub fn add_rule(mut self, rule: Rule) -> Self {
        self.rules.push(RuleEntry::Built(Arc::new(rule)));
        self
    }

    /// Share another manager's rules, and therefore their quota state.
    pub fn inherit(mut self, parent: &Manager) -> Self {
        self.rules.extend(parent.rules.iter().cloned().map(RuleEntry::Built));
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> std::result::Result<Manager, ConfigError> {
        let mut rules = Vec::with_capacity(self.rules.len());
        let mut resources: Vec<String> = Vec::new();
        for entry in self.rules {
            let rule = match entry {
                RuleEntry::Built(rule) => rule,
                RuleEntry::Config(config) => Arc::new(Rule::new(*config)?),
            };
            // a rule reached through two parents is still checked and reserved once
            if rules.iter().any(|known: &Arc<Rule>| known.id() == rule.id()) {
                continue;
            }
            if let Some(resource) = rule.resource() {
                if !resources.iter().any(|known| known == resource) {
                    resources.push(resource.to_string());
                }
            }
            rules.push(rule);
        }
        Ok(Manager {
            label: self.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            rules,
            resources,
            backoff: self.backoff.map(Arc::new),
        })
    }
}

struct Target {
    rule: Arc<Rule>,
    bundle: Arc<ScopeBundle>,
    amount: u64,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| rule.name() == Some(name))
    }

    /// Distinct resource names declared by the rules, in declaration order.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn backoff(&self) -> Option<&Backoff> {
        self.backoff.as_deref()
    }

    /// Feed an out-of-band failure to the backoff. Returns whether it activated.
    pub fn report_error(&self, error: &ReportedError) -> bool {
        self.backoff.as_ref().is_some_and(|backoff| backoff.activate(error))
    }

    pub async fn request_quota(
        &self,
        scope: &Scope,
        resources: &Resources,
        options: &RequestOptions,
    ) -> Result<Grant> {
        self.request_quota_as(&self.label, scope, resources, options).await
    }

    /// Like [`Manager::request_quota`], reporting errors under `manager_name`.
    pub async fn request_quota_as(
        &self,
        manager_name: &str,
        scope: &Scope,
        resources: &Resources,
        options: &RequestOptions,
    ) -> Result<Grant> {
        let targets = self.targets(scope, resources)?;
        let mut admission = Admission::new(manager_name);
        loop {
            if let Some(backoff) = &self.backoff {
                backoff.wait_if_necessary(manager_name, admission.backoff_deadline(options)).await?;
            }
            match admission.pass(&targets, options)? {
                Pass::Granted(granted) => {
                    return Ok(Grant::new(manager_name.to_string(), self.backoff.clone(), granted))
                }
                Pass::Queued(wake) => admission.wait(wake).await?,
            }
        }
    }

    fn relevant_rules(&self, resources: &Resources) -> std::result::Result<Vec<&Arc<Rule>>, ConfigError> {
        let relevant: Vec<&Arc<Rule>> = if resources.is_named() {
            self.rules
                .iter()
                .filter(|rule| resources.names().any(|name| rule.limits_resource(name)))
                .collect()
        } else {
            if self.resources.len() > 1 {
                return Err(ConfigError::ResourceSelectionRequired { resources: self.resources.clone() });
            }
            self.rules.iter().collect()
        };
        if relevant.is_empty() {
            return Err(ConfigError::NoRelevantRules { resources: self.resources.clone() });
        }
        Ok(relevant)
    }

    fn targets(&self, scope: &Scope, resources: &Resources) -> std::result::Result<Vec<Target>, ConfigError> {
        self.relevant_rules(resources)?
            .into_iter()
            .map(|rule| {
                Ok(Target { rule: rule.clone(), bundle: rule.bundle(scope)?, amount: rule.amount(resources)? })
            })
            .collect()
    }
}

enum Pass {
    Granted(Vec<GrantedRule>),
    Queued(oneshot::Receiver<()>),
}

/// State of one `request_quota` call across its passes.
///
/// Dropping it (caller cancelled, timed out, or failed) leaves the queue it was waiting in and
/// passes on any wake-up it was holding.
struct Admission<'a> {
    manager_name: &'a str,
    started: Instant,
    request: Option<Arc<QueuedRequest>>,
    /// Rule the request was last queued for.
    last_rule: Option<u64>,
    last_rule_name: Option<String>,
    deadline: Option<Instant>,
    queued_on: Option<Arc<ScopeBundle>>,
    /// Bundle whose wake-up this request holds until its pass completes.
    woken_by: Option<Arc<ScopeBundle>>,
}

impl<'a> Admission<'a> {
    fn new(manager_name: &'a str) -> Self {
        Self {
            manager_name,
            started: Instant::now(),
            request: None,
            last_rule: None,
            last_rule_name: None,
            deadline: None,
            queued_on: None,
            woken_by: None,
        }
    }

    fn backoff_deadline(&self, options: &RequestOptions) -> Option<Instant> {
        self.deadline.or_else(|| options.max_wait.and_then(|max_wait| self.started.checked_add(max_wait)))
    }

    fn pass(&mut self, targets: &[Target], options: &RequestOptions) -> Result<Pass> {
        if let Some(request) = &self.request {
            if !request.is_valid() {
                return Err(QuotaError::out_of_quota(self.manager_name, self.last_rule_name.as_deref()));
            }
        }

        let mut order: Vec<&Arc<ScopeBundle>> =
            targets.iter().map(|target| &target.bundle).chain(self.woken_by.as_ref()).collect();
        order.sort_by_key(|bundle| bundle.id());
        order.dedup_by_key(|bundle| bundle.id());
        let mut guards: Vec<MutexGuard<'_, BundleState>> = order.iter().map(|bundle| bundle.lock()).collect();
        let slot = |id: u64| order.binary_search_by_key(&id, |b| b.id()).unwrap_or_else(|index| index);

        let queued = self.request.is_some();
        let blocked = targets.iter().find(|t| !guards[slot(t.bundle.id())].admits(t.amount, queued));

        let Some(blocked) = blocked else {
            let mut granted = Vec::with_capacity(targets.len());
            let mut decays = Vec::new();
            for target in targets {
                let reservation = guards[slot(target.bundle.id())].throttling.reserve(target.amount);
                decays.push((target.bundle.clone(), reservation));
                granted.push(GrantedRule {
                    rule: target.rule.clone(),
                    bundle: target.bundle.clone(),
                    amount: target.amount,
                });
            }
            drop(guards);
            for (bundle, reservation) in decays {
                bundle.schedule_decay(reservation);
            }
            self.request = None;
            self.release_wake();
            trace!(manager = self.manager_name, rules = granted.len(), "quota granted");
            return Ok(Pass::Granted(granted));
        };

        if self.deadline.is_none() {
            self.deadline = options.max_wait.and_then(|max_wait| Instant::now().checked_add(max_wait));
        }
        let state = &mut guards[slot(blocked.bundle.id())];
        let expired = self.deadline.is_some_and(|deadline| deadline <= Instant::now());
        if !state.has_queue() || expired {
            drop(guards);
            self.release_wake();
            debug!(manager = self.manager_name, rule = ?blocked.rule.name(), "out of quota");
            return Err(QuotaError::out_of_quota(self.manager_name, blocked.rule.name()));
        }

        let manager_name = self.manager_name;
        let request = self.request.get_or_insert_with(|| Arc::new(QueuedRequest::new(manager_name))).clone();
        let wake = request.arm();
        let again = self.last_rule == Some(blocked.rule.id());
        state.enqueue(request.clone(), again);
        let spent = again && self.woken_by.as_ref().is_some_and(|woken_by| woken_by.id() == blocked.bundle.id());
        if spent {
            // keeps its place and its wake-up is spent here; nothing to pass on
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        let waiting = state.queueing.as_ref().map_or(0, |q| q.number_waiting());
        drop(guards);

        if spent {
            self.woken_by = None;
        }
        self.last_rule = Some(blocked.rule.id());
        self.last_rule_name = blocked.rule.name().map(str::to_string);
        self.queued_on = Some(blocked.bundle.clone());
        self.release_wake();
        debug!(
            manager = self.manager_name,
            rule = ?blocked.rule.name(),
            scope = blocked.bundle.key(),
            request = request.id(),
            again,
            waiting,
            "request queued"
        );
        Ok(Pass::Queued(wake))
    }

    async fn wait(&mut self, wake: oneshot::Receiver<()>) -> Result<()> {
        let woken = match self.deadline {
            Some(deadline) => matches!(tokio::time::timeout_at(deadline, wake).await, Ok(Ok(()))),
            None => wake.await.is_ok(),
        };
        if woken {
            self.woken_by = self.queued_on.take();
            return Ok(());
        }
        self.abort();
        debug!(manager = self.manager_name, rule = ?self.last_rule_name, "gave up waiting for quota");
        Err(QuotaError::out_of_quota(self.manager_name, self.last_rule_name.as_deref()))
    }

    fn release_wake(&mut self) {
        if let Some(bundle) = self.woken_by.take() {
            bundle.finish_wake();
        }
    }

    fn abort(&mut self) {
        if let Some(bundle) = self.queued_on.take() {
            if let Some(request) = &self.request {
                bundle.abort(request);
            }
        }
        self.release_wake();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}
