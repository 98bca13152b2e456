//! A single limiting constraint and its per-scope state.
//!
//! ```rust
//! use quotaflow::RuleConfig;
//! use std::time::Duration;
//!
//! let rule = RuleConfig::new("window-sliding")
//!     .name("per-user")
//!     .resource("requests")
//!     .scope(["userId"])
//!     .limit(100)
//!     .window(Duration::from_secs(60))
//!     .queueing("fifo")
//!     .build()
//!     .unwrap();
//! assert!(rule.limits_resource("requests"));
//! assert!(!rule.limits_resource("bytes"));
//! ```

use crate::bundle::ScopeBundle;
use crate::clock::Clock;
use crate::error::{ConfigError, QuotaError, ReportedError};
use crate::grant::RuleFeedback;
use crate::queued_request::QueuedRequest;
use crate::registry::{self, QueueingFactory, StrategyRegistry, ThrottlingFactory};
use crate::resources::{RequestOptions, Resources};
use crate::scope::{format_scope, Scope};
use crate::throttling::{ErrorContext, OnError, ThrottlingOptions, WindowSchedule};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Builder-style definition of a [`Rule`].
#[derive(Clone)]
pub struct RuleConfig {
    name: Option<String>,
    resource: Option<String>,
    scope: Vec<String>,
    throttling: String,
    options: ThrottlingOptions,
    queueing: Option<String>,
    on_error: Option<OnError>,
}

impl fmt::Debug for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleConfig")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("scope", &self.scope)
            .field("throttling", &self.throttling)
            .field("options", &self.options)
            .field("queueing", &self.queueing)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl RuleConfig {
    /// Start a rule using the throttling registered under `throttling`.
    pub fn new(throttling: impl Into<String>) -> Self {
        Self {
            name: None,
            resource: None,
            scope: Vec::new(),
            throttling: throttling.into(),
            options: ThrottlingOptions::default(),
            queueing: None,
            on_error: None,
        }
    }

    /// Key for per-rule feedback.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only requests for this resource are limited. Without it, every resource is.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Ordered scope dimensions partitioning the rule's state.
    pub fn scope<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = dimensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.options.window = Some(window);
        self
    }

    /// When `window-fixed` windows start; defaults to epoch-aligned windows of `window`.
    pub fn window_schedule(mut self, schedule: WindowSchedule) -> Self {
        self.options.schedule = Some(schedule);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.options.clock = Some(clock);
        self
    }

    pub fn queueing(mut self, queueing: impl Into<String>) -> Self {
        self.queueing = Some(queueing.into());
        self
    }

    /// React to errors reported in dismiss feedback, typically by saturating.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ErrorContext<'_>, &ReportedError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Rule, ConfigError> {
        Rule::new(self)
    }
}

/// A validated rule owning one [`ScopeBundle`] per formatted scope key.
///
/// Bundles are created lazily and live as long as the rule.
pub struct Rule {
    id: u64,
    name: Option<String>,
    resource: Option<String>,
    scope: Vec<String>,
    options: ThrottlingOptions,
    throttling: ThrottlingFactory,
    queueing: Option<QueueingFactory>,
    on_error: Option<OnError>,
    bundles: Mutex<HashMap<String, Arc<ScopeBundle>>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("scope", &self.scope)
            .field("options", &self.options)
            .field("queueing", &self.queueing.is_some())
            .finish()
    }
}

/// Capacity reserved directly on one rule. Dismiss it to hand the capacity back.
#[derive(Debug)]
pub struct RuleReservation {
    pub(crate) bundle: Arc<ScopeBundle>,
    pub(crate) amount: u64,
}

impl RuleReservation {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn dismiss(self, feedback: &RuleFeedback) {
        self.bundle.release(self.amount, feedback);
    }
}

/// A woken place in one rule's queue.
///
/// Newcomers stay blocked on the rule until the turn is dropped or handed back to
/// [`Rule::enqueue`].
#[derive(Debug)]
pub struct RuleTurn {
    rule: u64,
    bundle: Option<Arc<ScopeBundle>>,
    request: Arc<QueuedRequest>,
    deadline: Option<Instant>,
}

impl RuleTurn {
    pub fn request(&self) -> &Arc<QueuedRequest> {
        &self.request
    }
}

impl Drop for RuleTurn {
    fn drop(&mut self) {
        if let Some(bundle) = self.bundle.take() {
            bundle.finish_wake();
        }
    }
}

// Aborts the request if the wait ends without a wake-up.
struct Waiting<'a> {
    bundle: &'a ScopeBundle,
    request: &'a QueuedRequest,
    woken: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if !self.woken {
            self.bundle.abort(self.request);
        }
    }
}

impl Rule {
    pub fn new(config: RuleConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, registry::global())
    }

    /// Resolve strategies from `registry`. The throttling is built once up front so bad
    /// parameters fail here rather than on the first request.
    pub fn with_registry(config: RuleConfig, registry: &StrategyRegistry) -> Result<Self, ConfigError> {
        if config.scope.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyScopeName);
        }
        let throttling = registry.throttling(&config.throttling)?;
        throttling(&config.options)?;
        let queueing = config.queueing.as_deref().map(|name| registry.queueing(name)).transpose()?;
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: config.name,
            resource: config.resource,
            scope: config.scope,
            options: config.options,
            throttling,
            queueing,
            on_error: config.on_error,
            bundles: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    pub fn has_queueing(&self) -> bool {
        self.queueing.is_some()
    }

    pub fn limits_resource(&self, resource: &str) -> bool {
        self.resource.as_deref().map_or(true, |own| own == resource)
    }

    pub fn scope_key(&self, scope: &Scope) -> Result<String, ConfigError> {
        format_scope(&self.scope, scope)
    }

    pub fn amount(&self, resources: &Resources) -> Result<u64, ConfigError> {
        resources.amount_for(self.resource.as_deref())
    }

    /// The bundle for `scope`, created on first use.
    pub fn bundle(&self, scope: &Scope) -> Result<Arc<ScopeBundle>, ConfigError> {
        let key = self.scope_key(scope)?;
        let mut bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bundle) = bundles.get(&key) {
            return Ok(bundle.clone());
        }
        let throttling = (self.throttling)(&self.options)?;
        let queueing = self.queueing.as_ref().map(|factory| factory());
        let label = self.name.clone().unwrap_or_else(|| format!("rule-{}", self.id));
        let bundle = ScopeBundle::new(label, key.clone(), throttling, queueing, self.on_error.clone())?;
        bundles.insert(key, bundle.clone());
        Ok(bundle)
    }

    /// Number of scope bundles created so far.
    pub fn bundle_count(&self) -> usize {
        self.bundles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether `resources` could be reserved for `scope` right now.
    ///
    /// Without `queued`, a non-empty wait list makes the rule unavailable regardless of
    /// capacity.
    pub fn is_available(
        &self,
        scope: &Scope,
        resources: &Resources,
        queued: Option<&QueuedRequest>,
    ) -> Result<bool, ConfigError> {
        let bundle = self.bundle(scope)?;
        let amount = self.amount(resources)?;
        let available = bundle.lock().admits(amount, queued.is_some_and(QueuedRequest::is_valid));
        Ok(available)
    }

    /// Reserve without checking. Pair with a preceding [`Rule::is_available`].
    pub fn reserve(&self, scope: &Scope, resources: &Resources) -> Result<RuleReservation, ConfigError> {
        let bundle = self.bundle(scope)?;
        let amount = self.amount(resources)?;
        let reservation = bundle.lock().throttling.reserve(amount);
        bundle.schedule_decay(reservation);
        Ok(RuleReservation { bundle, amount })
    }

    /// Wait in the queue for `scope` until capacity frees up.
    ///
    /// Pass the previous turn to keep waiting as the same request: a request coming back to
    /// the rule it was last woken on goes to the front, and `max_wait` counts from its first
    /// enqueue. Fails with `OutOfQuota` when the rule has no queueing or the wait runs out.
    pub async fn enqueue(
        &self,
        manager_name: &str,
        scope: &Scope,
        options: &RequestOptions,
        previous: Option<RuleTurn>,
    ) -> Result<RuleTurn, QuotaError> {
        let bundle = self.bundle(scope)?;
        let (request, deadline, again, mut held) = match previous {
            Some(mut turn) => {
                let held = turn.bundle.take();
                (turn.request.clone(), turn.deadline, turn.rule == self.id, held)
            }
            None => {
                let deadline = options.max_wait.and_then(|max_wait| Instant::now().checked_add(max_wait));
                (Arc::new(QueuedRequest::new(manager_name)), deadline, false, None)
            }
        };
        let out_of_quota = || QuotaError::out_of_quota(manager_name, self.name());

        let expired = deadline.is_some_and(|deadline| deadline <= Instant::now());
        if !request.is_valid() || expired {
            if let Some(held) = held {
                held.finish_wake();
            }
            return Err(out_of_quota());
        }

        let wake = request.arm();
        {
            let mut state = bundle.lock();
            if !state.has_queue() {
                drop(state);
                if let Some(held) = held {
                    held.finish_wake();
                }
                return Err(out_of_quota());
            }
            state.enqueue(request.clone(), again);
            if again && held.as_ref().is_some_and(|held| held.id() == bundle.id()) {
                // keeps its place, so the wake-up is spent here
                state.in_flight = state.in_flight.saturating_sub(1);
                held = None;
            }
        }
        if let Some(held) = held {
            held.finish_wake();
        }
        debug!(rule = ?self.name(), scope = bundle.key(), request = request.id(), again, "rule enqueued");

        let mut waiting = Waiting { bundle: &bundle, request: &request, woken: false };
        waiting.woken = match deadline {
            Some(deadline) => matches!(tokio::time::timeout_at(deadline, wake).await, Ok(Ok(()))),
            None => wake.await.is_ok(),
        };
        if !waiting.woken {
            return Err(out_of_quota());
        }
        drop(waiting);

        Ok(RuleTurn { rule: self.id, bundle: Some(bundle.clone()), request, deadline })
    }
}
