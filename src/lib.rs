#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaflow
//!
//! Quota and rate-limit admission control for async Rust. Callers ask a [`Manager`] for
//! permission to consume a resource; the manager checks every relevant [`Rule`], queues the
//! request fairly when a rule is exhausted, and hands out a [`Grant`] once all of them admit it.
//! Dismissing the grant returns capacity and feeds errors or learned limits back into the rules
//! and the manager's [`Backoff`].
//!
//! ## Features
//!
//! - **Throttling strategies**: absolute and concurrency limits, fixed and sliding windows,
//!   unlimited, plus custom ones through a [`StrategyRegistry`]
//! - **Scopes**: one independent quota state per scope value (user, API key, ...)
//! - **FIFO queueing** with `max_wait` deadlines; late arrivals never overtake waiters
//! - **Backoff** (timeout or exponential) after reported upstream failures
//! - **Broker** addressing managers by name and grants by id, with a serializable error form
//! - **Presets** for well-known APIs and a **tower** layer
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaflow::{Feedback, Manager, RequestOptions, Resources, RuleConfig, RuleFeedback, Scope};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), quotaflow::QuotaError> {
//!     let manager = Manager::builder()
//!         .label("github")
//!         .rule(
//!             RuleConfig::new("window-sliding")
//!                 .name("hourly")
//!                 .limit(5000)
//!                 .window(Duration::from_secs(3600))
//!                 .scope(["token"])
//!                 .queueing("fifo"),
//!         )
//!         .build()?;
//!
//!     let scope = Scope::new().with("token", "abc");
//!     let grant = manager.request_quota(&scope, &Resources::Default, &RequestOptions::default()).await?;
//!     // ... call the API, then report what it said about the limit ...
//!     grant.dismiss(Feedback::new().for_rule("hourly", RuleFeedback::limit(4000)));
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broker;
mod bundle;
pub mod clock;
pub mod config;
pub mod error;
pub mod grant;
pub mod jitter;
pub mod manager;
pub mod middleware;
pub mod prelude;
pub mod presets;
pub mod queued_request;
pub mod queueing;
pub mod registry;
pub mod resources;
pub mod rule;
pub mod scope;
pub mod sleeper;
pub mod throttling;

// Re-exports
pub use backoff::{Backoff, BackoffPolicy};
pub use broker::{Broker, GrantId};
pub use bundle::ScopeBundle;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ManagerConfig, RuleSpec, ScopeSpec, StrategySpec};
pub use error::{ConfigError, QuotaError, ReportedError, Result, StrategyKind, WireError};
pub use grant::{Feedback, Grant, RuleFeedback};
pub use jitter::Jitter;
pub use manager::{Manager, ManagerBuilder};
pub use middleware::{QuotaLayer, QuotaService, QuotaServiceError};
pub use presets::Preset;
pub use queued_request::{QueuedRequest, QueuedState};
pub use queueing::{Fifo, Queueing};
pub use registry::{BackoffOptions, StrategyRegistry};
pub use resources::{RequestOptions, Resources};
pub use rule::{Rule, RuleConfig, RuleReservation, RuleTurn};
pub use scope::Scope;
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use throttling::{ErrorContext, Reservation, Throttling, ThrottlingOptions, WindowSchedule};
