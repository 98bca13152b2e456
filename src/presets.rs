//! Ready-made managers for well-known rate-limited APIs.
//!
//! Each preset encodes the published limits of one API. Single-manager presets return
//! [`Preset::Single`]; APIs with separately limited endpoint families return [`Preset::Multi`],
//! where every entry inherits the `general` entry's rules and therefore shares its quota state.
//!
//! ```rust
//! use quotaflow::presets;
//! use quotaflow::Broker;
//!
//! let broker = Broker::new();
//! broker.add_preset("bitly", presets::bitly(presets::BitlyOptions::default())?)?;
//! broker.add_preset("ga", presets::google_analytics(presets::GoogleAnalyticsOptions::default())?)?;
//! assert!(broker.list_managers().contains(&"ga-management".to_string()));
//! # Ok::<(), quotaflow::ConfigError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{Backoff, DEFAULT_TIMEOUT_DELAY};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::manager::Manager;
use crate::rule::RuleConfig;
use crate::throttling::WindowSchedule;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;
/// Midnight Pacific Standard Time, as an offset into the UTC day.
const PST_MIDNIGHT_MILLIS: u64 = 8 * 60 * 60 * 1000;
const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Output of a preset, ready for [`Broker::add_preset`](crate::Broker::add_preset).
#[derive(Debug, Clone)]
pub enum Preset {
    Single(Arc<Manager>),
    /// Entries keyed by endpoint family. The `general` entry holds the shared project limits.
    Multi(Vec<(String, Arc<Manager>)>),
}

impl Preset {
    /// Look up an entry. A single-manager preset answers to any key.
    pub fn get(&self, key: &str) -> Option<&Arc<Manager>> {
        match self {
            Preset::Single(manager) => Some(manager),
            Preset::Multi(entries) => entries.iter().find(|(name, _)| name == key).map(|(_, m)| m),
        }
    }
}

fn timeout_backoff() -> Backoff {
    Backoff::timeout(DEFAULT_TIMEOUT_DELAY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitlyOptions {
    pub concurrent_requests: u64,
    /// Limit per client IP address instead of per process.
    pub shared_ip_address: bool,
}

impl Default for BitlyOptions {
    fn default() -> Self {
        Self { concurrent_requests: 5, shared_ip_address: false }
    }
}

/// Bitly: concurrent requests per IP address.
pub fn bitly(options: BitlyOptions) -> Result<Preset, ConfigError> {
    let mut rule = RuleConfig::new("limit-concurrency")
        .limit(options.concurrent_requests)
        .queueing("fifo")
        .resource("requests");
    if options.shared_ip_address {
        rule = rule.scope(["ipAddress"]);
    }
    let manager = Manager::builder().label("bitly").backoff(timeout_backoff()).rule(rule).build()?;
    Ok(Preset::Single(Arc::new(manager)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchonestOptions {
    /// Requests per minute.
    pub limit: u64,
}

impl Default for EchonestOptions {
    fn default() -> Self {
        Self { limit: 120 }
    }
}

/// The Echo Nest: requests per sliding minute.
pub fn echonest(options: EchonestOptions) -> Result<Preset, ConfigError> {
    let manager = Manager::builder()
        .label("echonest")
        .backoff(timeout_backoff())
        .rule(
            RuleConfig::new("window-sliding")
                .name("main")
                .limit(options.limit)
                .window(MINUTE)
                .queueing("fifo")
                .resource("requests"),
        )
        .build()?;
    Ok(Preset::Single(Arc::new(manager)))
}

/// Facebook: the Graph API only backs off; the Marketing API additionally allows four budget
/// changes per ad set and hour.
pub fn facebook() -> Result<Preset, ConfigError> {
    let graph = Arc::new(
        Manager::builder()
            .label("facebook-graph")
            .backoff(timeout_backoff())
            .rule(RuleConfig::new("unlimited").resource("requests"))
            .build()?,
    );
    let marketing = Manager::builder()
        .label("facebook-marketing")
        .backoff(timeout_backoff())
        .rule(RuleConfig::new("unlimited").resource("requests"))
        .rule(
            RuleConfig::new("window-sliding")
                .limit(4)
                .window(HOUR)
                .queueing("fifo")
                .scope(["adSetId"])
                .resource("budgetChange"),
        )
        .build()?;
    Ok(Preset::Multi(vec![
        ("general".into(), graph.clone()),
        ("graph".into(), graph),
        ("marketing".into(), Arc::new(marketing)),
    ]))
}

#[derive(Debug, Clone)]
pub struct GoogleAnalyticsOptions {
    pub daily_requests: u64,
    pub daily_writes: u64,
    pub queries_per_second: u64,
    /// Apply the QPS limit per `userId` scope.
    pub qps_per_user: bool,
    /// Apply the QPS limit per `ipAddress` scope. Ignored when `qps_per_user` is set.
    pub shared_ip_address: bool,
    /// Wall clock the daily windows are aligned with.
    pub clock: Arc<dyn Clock>,
}

impl Default for GoogleAnalyticsOptions {
    fn default() -> Self {
        Self {
            daily_requests: 50_000,
            daily_writes: 500,
            queries_per_second: 1,
            qps_per_user: false,
            shared_ip_address: false,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Next 08:00 UTC (midnight PST) strictly after `now_millis`.
pub fn next_pacific_midnight(now_millis: u64) -> u64 {
    let today = now_millis - now_millis % DAY_MILLIS + PST_MIDNIGHT_MILLIS;
    if today > now_millis {
        today
    } else {
        today + DAY_MILLIS
    }
}

/// Google Analytics reporting and configuration APIs. Daily quotas refresh at midnight PST.
///
/// Entries: `general`, `management`, `provisioning`, `core`, `real-time` (same manager as
/// `core`) and `mcf`.
pub fn google_analytics(options: GoogleAnalyticsOptions) -> Result<Preset, ConfigError> {
    let clock = options.clock.clone();
    let daily = move |limit: u64| {
        let clock = clock.clone();
        RuleConfig::new("window-fixed")
            .limit(limit)
            .window_schedule(WindowSchedule::custom({
                let clock = clock.clone();
                move || next_pacific_midnight(clock.now_millis())
            }))
            .clock(clock)
    };
    let per_view_concurrency =
        || RuleConfig::new("limit-concurrency").limit(10).queueing("fifo").scope(["viewId"]).resource("requests");

    let mut qps = RuleConfig::new("window-sliding")
        .limit(options.queries_per_second)
        .window(Duration::from_secs(1))
        .queueing("fifo")
        .resource("requests");
    if options.qps_per_user {
        qps = qps.scope(["userId"]);
    } else if options.shared_ip_address {
        qps = qps.scope(["ipAddress"]);
    }

    let general = Manager::builder()
        .label("google-analytics-general")
        .backoff(timeout_backoff())
        .rule(daily(options.daily_requests).resource("requests"))
        .rule(qps)
        .build()?;

    let management = Manager::builder()
        .label("google-analytics-management")
        .backoff(timeout_backoff())
        .inherit(&general)
        .rule(daily(options.daily_writes).resource("writeRequests"))
        .rule(RuleConfig::new("limit-absolute").limit(10 * GIB).scope(["userId", "propertyId"]).resource("bytes"))
        .rule(RuleConfig::new("limit-absolute").limit(10 * GIB).scope(["userId", "datasetId"]).resource("bytes"))
        .rule(RuleConfig::new("limit-absolute").limit(50).scope(["userId", "propertyId"]).resource("datasets"))
        .rule(daily(50).scope(["userId", "propertyId"]).resource("writeRequests"))
        .rule(
            RuleConfig::new("limit-absolute")
                .limit(100 * MIB)
                .scope(["userId", "datasetId", "date"])
                .resource("bytes"),
        )
        .rule(daily(100).scope(["userId", "propertyId"]).resource("unsampledReports"))
        .build()?;

    let provisioning = Manager::builder()
        .label("google-analytics-provisioning")
        .backoff(timeout_backoff())
        .inherit(&general)
        .rule(daily(50).resource("writeRequests"))
        .build()?;

    let reporting = Arc::new(
        Manager::builder()
            .label("google-analytics-reporting")
            .backoff(timeout_backoff())
            .inherit(&general)
            .rule(daily(10_000).scope(["viewId"]).resource("requests"))
            .rule(per_view_concurrency())
            .build()?,
    );

    let mcf = Manager::builder()
        .label("google-analytics-mcf")
        .backoff(timeout_backoff())
        .inherit(&general)
        .rule(per_view_concurrency())
        .build()?;

    Ok(Preset::Multi(vec![
        ("general".into(), Arc::new(general)),
        ("management".into(), Arc::new(management)),
        ("provisioning".into(), Arc::new(provisioning)),
        ("core".into(), reporting.clone()),
        ("real-time".into(), reporting),
        ("mcf".into(), Arc::new(mcf)),
    ]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamworkOptions {
    /// Concurrent requests per API key; `None` disables the concurrency rule.
    pub concurrent_limit: Option<u64>,
}

impl Default for TeamworkOptions {
    fn default() -> Self {
        Self { concurrent_limit: Some(10) }
    }
}

/// Teamwork: 150 requests per sliding minute and API key, plus an undocumented concurrency cap.
pub fn teamwork(options: TeamworkOptions) -> Result<Preset, ConfigError> {
    let mut builder = Manager::builder().label("teamwork").rule(
        RuleConfig::new("window-sliding")
            .limit(150)
            .window(MINUTE)
            .queueing("fifo")
            .resource("requests")
            .scope(["apiKey"]),
    );
    if let Some(limit) = options.concurrent_limit {
        if limit == 0 {
            return Err(ConfigError::InvalidOption(
                "the concurrent limit needs to be unset or greater than 0".into(),
            ));
        }
        builder = builder.rule(
            RuleConfig::new("limit-concurrency")
                .limit(limit)
                .queueing("fifo")
                .resource("requests")
                .scope(["apiKey"]),
        );
    }
    Ok(Preset::Single(Arc::new(builder.build()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resources::{RequestOptions, Resources};
    use crate::scope::Scope;

    fn single(preset: Preset) -> Arc<Manager> {
        match preset {
            Preset::Single(manager) => manager,
            Preset::Multi(_) => panic!("expected a single manager"),
        }
    }

    #[test]
    fn pacific_midnight() {
        let day = DAY_MILLIS;
        assert_eq!(next_pacific_midnight(0), PST_MIDNIGHT_MILLIS);
        assert_eq!(next_pacific_midnight(PST_MIDNIGHT_MILLIS), day + PST_MIDNIGHT_MILLIS);
        assert_eq!(next_pacific_midnight(3 * day + 9 * 60 * 60 * 1000), 4 * day + PST_MIDNIGHT_MILLIS);
    }

    #[test]
    fn bitly_scopes_by_ip_when_shared() {
        let manager = single(bitly(BitlyOptions::default()).unwrap());
        assert!(manager.rules()[0].scope().is_empty());
        assert!(manager.backoff().is_some());

        let shared = single(bitly(BitlyOptions { shared_ip_address: true, ..BitlyOptions::default() }).unwrap());
        assert_eq!(shared.rules()[0].scope(), ["ipAddress".to_string()]);
    }

    #[test]
    fn echonest_rule_is_named_main() {
        let manager = single(echonest(EchonestOptions::default()).unwrap());
        assert!(manager.rule("main").is_some());
        assert_eq!(manager.resources(), ["requests".to_string()]);
    }

    #[test]
    fn facebook_graph_is_general() {
        let preset = facebook().unwrap();
        assert!(Arc::ptr_eq(preset.get("general").unwrap(), preset.get("graph").unwrap()));
        assert_eq!(preset.get("marketing").unwrap().resources(), ["requests".to_string(), "budgetChange".to_string()]);
    }

    #[test]
    fn google_analytics_children_share_general_rules() {
        let preset = google_analytics(GoogleAnalyticsOptions::default()).unwrap();
        let general = preset.get("general").unwrap();
        for key in ["management", "provisioning", "core", "mcf"] {
            let child = preset.get(key).unwrap();
            assert!(Arc::ptr_eq(&child.rules()[0], &general.rules()[0]), "{key}");
        }
        assert!(Arc::ptr_eq(preset.get("core").unwrap(), preset.get("real-time").unwrap()));
        assert_eq!(preset.get("management").unwrap().rules().len(), 9);
    }

    #[test]
    fn teamwork_concurrency_is_optional() {
        assert_eq!(single(teamwork(TeamworkOptions::default()).unwrap()).rules().len(), 2);
        assert_eq!(single(teamwork(TeamworkOptions { concurrent_limit: None }).unwrap()).rules().len(), 1);
        assert!(teamwork(TeamworkOptions { concurrent_limit: Some(0) }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn google_analytics_daily_window_resets_at_pacific_midnight() {
        let clock = ManualClock::new(PST_MIDNIGHT_MILLIS - 1000);
        let options = GoogleAnalyticsOptions { daily_writes: 1, clock: Arc::new(clock), ..Default::default() };
        let preset = google_analytics(options).unwrap();
        let management = preset.get("management").unwrap();
        let writes = Resources::named([("writeRequests", 1)]);
        let scope = Scope::new().with("userId", "u").with("propertyId", "p");
        let no_wait = RequestOptions::max_wait(Duration::ZERO);

        management.request_quota(&scope, &writes, &no_wait).await.unwrap().release();
        assert!(management.request_quota(&scope, &writes, &no_wait).await.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        management.request_quota(&scope, &writes, &no_wait).await.unwrap().release();
    }
}
