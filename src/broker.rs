//! Named managers and outstanding grants behind plain identifiers.
//!
//! The broker is what a transport talks to: managers are addressed by name, grants by a
//! [`GrantId`], and errors leave as [`WireError`](crate::error::WireError) values. A manager
//! may be registered under several names; each name reports errors under itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ConfigError, QuotaError, ReportedError, Result};
use crate::grant::{Feedback, Grant};
use crate::manager::Manager;
use crate::presets::Preset;
use crate::resources::{RequestOptions, Resources};
use crate::scope::Scope;

/// Identifier of a grant held by a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(Uuid);

impl GrantId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for GrantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Default)]
pub struct Broker {
    managers: RwLock<BTreeMap<String, Arc<Manager>>>,
    grants: Mutex<HashMap<GrantId, Grant>>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("managers", &self.list_managers())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    fn grants(&self) -> MutexGuard<'_, HashMap<GrantId, Grant>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `manager` under `name`. Names are unique.
    pub fn add_manager(&self, name: impl Into<String>, manager: impl Into<Arc<Manager>>) -> Result<(), ConfigError> {
        let name = name.into();
        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        if managers.contains_key(&name) {
            return Err(ConfigError::DuplicateManager { name });
        }
        debug!(manager = %name, "manager registered");
        managers.insert(name, manager.into());
        Ok(())
    }

    /// Register a preset under `name`.
    ///
    /// A multi-manager preset registers each entry as `name-<entry>`; its `general` entry is also
    /// available as plain `name`. Nothing is registered if any of the names is taken.
    pub fn add_preset(&self, name: &str, preset: Preset) -> Result<(), ConfigError> {
        let entries: Vec<(String, Arc<Manager>)> = match preset {
            Preset::Single(manager) => vec![(name.to_string(), manager)],
            Preset::Multi(managers) => {
                let mut entries = Vec::with_capacity(managers.len() + 1);
                for (sub, manager) in managers {
                    if sub == "general" {
                        entries.push((name.to_string(), manager.clone()));
                    }
                    entries.push((format!("{name}-{sub}"), manager));
                }
                entries
            }
        };

        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((taken, _)) = entries.iter().find(|(entry, _)| managers.contains_key(entry)) {
            return Err(ConfigError::DuplicateManager { name: taken.clone() });
        }
        for (entry, manager) in entries {
            debug!(manager = %entry, preset = name, "manager registered");
            managers.insert(entry, manager);
        }
        Ok(())
    }

    /// Registered names, sorted.
    pub fn list_managers(&self) -> Vec<String> {
        self.managers.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    pub fn manager(&self, name: &str) -> Option<Arc<Manager>> {
        self.managers.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<Manager>> {
        self.manager(name).ok_or_else(|| QuotaError::NoManager { manager_name: name.to_string() })
    }

    /// Request quota from the manager registered as `name` and keep the grant until it is
    /// dismissed by id.
    pub async fn request_quota(
        &self,
        name: &str,
        scope: &Scope,
        resources: &Resources,
        options: &RequestOptions,
    ) -> Result<GrantId> {
        let manager = self.require(name)?;
        let grant = manager.request_quota_as(name, scope, resources, options).await?;
        let id = GrantId::new();
        self.grants().insert(id, grant);
        trace!(manager = name, grant = %id, "grant issued");
        Ok(id)
    }

    /// Dismiss an outstanding grant. Returns `false` for unknown or already dismissed ids.
    pub fn dismiss(&self, id: GrantId, feedback: Feedback) -> bool {
        let grant = self.grants().remove(&id);
        match grant {
            Some(grant) => {
                trace!(manager = grant.manager_name(), grant = %id, "grant dismissed");
                grant.dismiss(feedback);
                true
            }
            None => {
                debug!(grant = %id, "dismiss for unknown grant ignored");
                false
            }
        }
    }

    /// Feed an error to a manager's backoff without dismissing any grant.
    pub fn report_error(&self, name: &str, error: ReportedError) -> Result<bool> {
        Ok(self.require(name)?.report_error(&error))
    }

    /// Grants issued and not dismissed yet.
    pub fn outstanding(&self) -> usize {
        self.grants().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::rule::RuleConfig;
    use std::io::Write;
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    fn single(limit: u64) -> Manager {
        Manager::builder().rule(RuleConfig::new("limit-concurrency").limit(limit)).build().unwrap()
    }

    #[test]
    fn names_are_unique() {
        let broker = Broker::new();
        broker.add_manager("github", single(1)).unwrap();
        let err = broker.add_manager("github", single(2)).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateManager { name: "github".into() });
        assert_eq!(broker.list_managers(), vec!["github".to_string()]);
    }

    #[test]
    fn multi_preset_registers_general_twice() {
        let broker = Broker::new();
        let preset = Preset::Multi(vec![("general".into(), Arc::new(single(1))), ("writes".into(), Arc::new(single(1)))]);
        broker.add_preset("api", preset).unwrap();
        assert_eq!(broker.list_managers(), vec!["api", "api-general", "api-writes"]);
        assert!(Arc::ptr_eq(&broker.manager("api").unwrap(), &broker.manager("api-general").unwrap()));
    }

    #[test]
    fn preset_with_taken_name_registers_nothing() {
        let broker = Broker::new();
        broker.add_manager("api-writes", single(1)).unwrap();
        let preset = Preset::Multi(vec![("general".into(), Arc::new(single(1))), ("writes".into(), Arc::new(single(1)))]);
        assert!(broker.add_preset("api", preset).is_err());
        assert_eq!(broker.list_managers(), vec!["api-writes"]);
    }

    #[tokio::test]
    async fn unknown_manager() {
        let broker = Broker::new();
        let err = broker
            .request_quota("nope", &Scope::new(), &Resources::Default, &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No manager with the name nope found");
        assert!(broker.report_error("nope", ReportedError::new("x")).is_err());
    }

    #[tokio::test]
    async fn grants_are_dismissed_once() {
        let broker = Broker::new();
        broker.add_manager("svc", single(1)).unwrap();
        let opts = RequestOptions::max_wait(Duration::ZERO);

        let id = broker.request_quota("svc", &Scope::new(), &Resources::Default, &opts).await.unwrap();
        assert_eq!(broker.outstanding(), 1);
        let err = broker.request_quota("svc", &Scope::new(), &Resources::Default, &opts).await.unwrap_err();
        assert_eq!(err, QuotaError::out_of_quota("svc", None));

        assert!(broker.dismiss(id, Feedback::default()));
        assert!(!broker.dismiss(id, Feedback::default()));
        assert_eq!(broker.outstanding(), 0);
        broker.request_quota("svc", &Scope::new(), &Resources::Default, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn errors_carry_the_registered_name() {
        let broker = Broker::new();
        let manager = Arc::new(single(1));
        broker.add_manager("primary", manager.clone()).unwrap();
        broker.add_manager("alias", manager).unwrap();
        let opts = RequestOptions::max_wait(Duration::ZERO);

        let _id = broker.request_quota("primary", &Scope::new(), &Resources::Default, &opts).await.unwrap();
        let err = broker.request_quota("alias", &Scope::new(), &Resources::Default, &opts).await.unwrap_err();
        assert_eq!(err.manager_name(), Some("alias"));
    }

    #[test]
    fn report_error_reaches_the_backoff() {
        let broker = Broker::new();
        let manager = Manager::builder()
            .rule(RuleConfig::new("unlimited"))
            .backoff(Backoff::timeout(Duration::from_secs(1)))
            .build()
            .unwrap();
        broker.add_manager("svc", manager).unwrap();
        assert!(broker.report_error("svc", ReportedError::new("503")).unwrap());
        assert!(broker.manager("svc").unwrap().backoff().unwrap().is_active());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_dismiss_is_logged() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let broker = Broker::new();
        assert!(!broker.dismiss(GrantId::new(), Feedback::default()));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("dismiss for unknown grant ignored"));
    }
}
