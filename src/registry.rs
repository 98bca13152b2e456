//! String-keyed factories for throttling, queueing and backoff strategies.
//!
//! Rules and declarative configs name their strategies (`"window-sliding"`, `"fifo"`,
//! `"exponential"`). The [`global`] registry knows the built-in ones; custom strategies can be
//! registered on it or on a private [`StrategyRegistry`].

use crate::backoff::{Backoff, DEFAULT_EXPONENTIAL_BASE, DEFAULT_TIMEOUT_DELAY};
use crate::error::{ConfigError, StrategyKind};
use crate::queueing::{Fifo, Queueing};
use crate::throttling::{
    LimitAbsolute, LimitConcurrency, Throttling, ThrottlingOptions, Unlimited, WindowFixed,
    WindowSchedule, WindowSliding,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::warn;

pub type ThrottlingFactory =
    Arc<dyn Fn(&ThrottlingOptions) -> Result<Box<dyn Throttling>, ConfigError> + Send + Sync>;
pub type QueueingFactory = Arc<dyn Fn() -> Box<dyn Queueing> + Send + Sync>;
pub type BackoffFactory = Arc<dyn Fn(&BackoffOptions) -> Result<Backoff, ConfigError> + Send + Sync>;

/// Parameters for backoff constructors. Unset fields use the strategy's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffOptions {
    pub delay: Option<Duration>,
    /// `Some(None)` forces an unbounded limit.
    pub limit: Option<Option<u32>>,
}

#[derive(Default)]
pub struct StrategyRegistry {
    throttling: RwLock<HashMap<String, ThrottlingFactory>>,
    queueing: RwLock<HashMap<String, QueueingFactory>>,
    backoff: RwLock<HashMap<String, BackoffFactory>>,
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn keys<V>(map: &RwLock<HashMap<String, V>>) -> Vec<String> {
            let mut keys: Vec<String> =
                map.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
            keys.sort();
            keys
        }
        f.debug_struct("StrategyRegistry")
            .field("throttling", &keys(&self.throttling))
            .field("queueing", &keys(&self.queueing))
            .field("backoff", &keys(&self.backoff))
            .finish()
    }
}

fn insert<V>(map: &RwLock<HashMap<String, V>>, kind: StrategyKind, name: String, value: V) {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    if map.insert(name.clone(), value).is_some() {
        warn!(%kind, strategy = %name, "replacing registered strategy");
    }
}

fn lookup<V: Clone>(
    map: &RwLock<HashMap<String, V>>,
    kind: StrategyKind,
    name: &str,
) -> Result<V, ConfigError> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownStrategy { kind, name: name.to_string() })
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in strategy.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_throttling("limit-absolute", |o| {
            Ok(Box::new(LimitAbsolute::new(o.limit)?) as Box<dyn Throttling>)
        });
        registry.register_throttling("limit-concurrency", |o| {
            Ok(Box::new(LimitConcurrency::new(o.limit)?) as Box<dyn Throttling>)
        });
        registry.register_throttling("window-fixed", |o| {
            let schedule = match (&o.schedule, o.window) {
                (Some(schedule), _) => schedule.clone(),
                (None, Some(window)) => WindowSchedule::Aligned(window),
                (None, None) => {
                    return Err(ConfigError::InvalidWindow { strategy: "window-fixed".into() })
                }
            };
            let mut throttling = WindowFixed::new(o.limit, schedule)?;
            if let Some(clock) = &o.clock {
                throttling = throttling.with_clock(clock.clone());
            }
            Ok(Box::new(throttling) as Box<dyn Throttling>)
        });
        registry.register_throttling("window-sliding", |o| {
            Ok(Box::new(WindowSliding::new(o.limit, o.window)?) as Box<dyn Throttling>)
        });
        registry.register_throttling("unlimited", |_| Ok(Box::new(Unlimited) as Box<dyn Throttling>));
        registry.register_queueing("fifo", || Box::new(Fifo::new()) as Box<dyn Queueing>);
        registry.register_backoff("timeout", |o| {
            let backoff = Backoff::timeout(o.delay.unwrap_or(DEFAULT_TIMEOUT_DELAY));
            Ok(match o.limit {
                Some(limit) => backoff.with_limit(limit),
                None => backoff,
            })
        });
        registry.register_backoff("exponential", |o| {
            let backoff = Backoff::exponential(o.delay.unwrap_or(DEFAULT_EXPONENTIAL_BASE));
            Ok(match o.limit {
                Some(limit) => backoff.with_limit(limit),
                None => backoff,
            })
        });
        registry
    }

    pub fn register_throttling<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ThrottlingOptions) -> Result<Box<dyn Throttling>, ConfigError> + Send + Sync + 'static,
    {
        insert(&self.throttling, StrategyKind::Throttling, name.into(), Arc::new(factory) as ThrottlingFactory);
    }

    pub fn register_queueing<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Queueing> + Send + Sync + 'static,
    {
        insert(&self.queueing, StrategyKind::Queueing, name.into(), Arc::new(factory) as QueueingFactory);
    }

    pub fn register_backoff<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackoffOptions) -> Result<Backoff, ConfigError> + Send + Sync + 'static,
    {
        insert(&self.backoff, StrategyKind::Backoff, name.into(), Arc::new(factory) as BackoffFactory);
    }

    pub fn throttling(&self, name: &str) -> Result<ThrottlingFactory, ConfigError> {
        lookup(&self.throttling, StrategyKind::Throttling, name)
    }

    pub fn queueing(&self, name: &str) -> Result<QueueingFactory, ConfigError> {
        lookup(&self.queueing, StrategyKind::Queueing, name)
    }

    pub fn backoff(&self, name: &str, options: &BackoffOptions) -> Result<Backoff, ConfigError> {
        lookup(&self.backoff, StrategyKind::Backoff, name)?(options)
    }
}

/// Process-wide registry with the built-in strategies.
pub fn global() -> &'static StrategyRegistry {
    static GLOBAL: OnceLock<StrategyRegistry> = OnceLock::new();
    GLOBAL.get_or_init(StrategyRegistry::with_builtins)
}
