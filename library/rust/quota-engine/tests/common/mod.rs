#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use k1s0_quota_engine::{
    CountScope, DbQuotaDriver, Expiration, InMemoryQuotaStore, ManualClock, QuotaConfig,
    QuotaContext, QuotaDetail, QuotaDriver, QuotaEngine, QuotaError, QuotaMap, QuotaQuery,
    QuotaStore, Reservation, Resource, ResourceRegistry, ScopedCounts, SettableQuota, SyncScope,
    UsageCount, UsageSync,
};

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn quotas(values: &[(&str, i64)]) -> QuotaMap {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// Sync function backed by a mutable map of authoritative counts.
pub struct FakeSync {
    scope: SyncScope,
    counts: Mutex<HashMap<String, i64>>,
    calls: AtomicUsize,
}

impl FakeSync {
    pub fn new(scope: SyncScope, counts: &[(&str, i64)]) -> Arc<Self> {
        Arc::new(Self {
            scope,
            counts: Mutex::new(
                counts
                    .iter()
                    .map(|(name, value)| (name.to_string(), *value))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, resource: &str, value: i64) {
        self.counts
            .lock()
            .unwrap()
            .insert(resource.to_string(), value);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageSync for FakeSync {
    fn scope(&self) -> SyncScope {
        self.scope
    }

    async fn sync(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _user_id: Option<&str>,
    ) -> anyhow::Result<HashMap<String, i64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.counts.lock().unwrap().clone())
    }
}

/// Counting function returning fixed per-scope counts.
pub struct FakeCount {
    counts: ScopedCounts,
    calls: AtomicUsize,
}

impl FakeCount {
    /// An empty `user` slice means the function reports no user-level counts.
    pub fn new(project: &[(&str, i64)], user: &[(&str, i64)]) -> Arc<Self> {
        let to_map = |values: &[(&str, i64)]| {
            values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<HashMap<_, _>>()
        };
        Arc::new(Self {
            counts: ScopedCounts {
                project: to_map(project),
                user: (!user.is_empty()).then(|| to_map(user)),
            },
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageCount for FakeCount {
    async fn count(&self, _ctx: &QuotaContext, _scope: &CountScope) -> anyhow::Result<ScopedCounts> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.counts.clone())
    }
}

pub fn default_config() -> QuotaConfig {
    QuotaConfig::default()
        .with_default("instances", 10)
        .with_default("cores", 20)
        .with_default("ram", 51200)
        .with_default("floating_ips", 10)
        .with_default("fixed_ips", -1)
        .with_default("key_pairs", 100)
        .with_default("metadata_items", 128)
}

/// Engine over the persisted driver and an in-memory store, with a manual clock.
pub struct Fixture {
    pub engine: QuotaEngine,
    pub store: Arc<InMemoryQuotaStore>,
    pub clock: Arc<ManualClock>,
    pub instance_sync: Arc<FakeSync>,
    pub ip_sync: Arc<FakeSync>,
    pub counter: Arc<FakeCount>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(default_config())
    }

    pub fn with_config(config: QuotaConfig) -> Self {
        let store = Arc::new(InMemoryQuotaStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let driver = DbQuotaDriver::with_clock(store.clone(), config, clock.clone());
        let mut engine = QuotaEngine::new(Arc::new(driver));

        let instance_sync = FakeSync::new(
            SyncScope::User,
            &[("instances", 0), ("cores", 0), ("ram", 0)],
        );
        let ip_sync = FakeSync::new(SyncScope::Project, &[("floating_ips", 0)]);
        let counter = FakeCount::new(&[("fixed_ips", 3), ("key_pairs", 4)], &[("key_pairs", 2)]);
        engine
            .register_resources(vec![
                Resource::reservable("instances", instance_sync.clone(), Some("instances")),
                Resource::reservable("cores", instance_sync.clone(), Some("cores")),
                Resource::reservable("ram", instance_sync.clone(), Some("ram")),
                Resource::reservable("floating_ips", ip_sync.clone(), Some("floating_ips")),
                Resource::countable("fixed_ips", counter.clone(), Some("fixed_ips")),
                Resource::countable("key_pairs", counter.clone(), Some("key_pairs")),
                Resource::absolute("metadata_items", Some("metadata_items")),
            ])
            .unwrap();

        Self {
            engine,
            store,
            clock,
            instance_sync,
            ip_sync,
            counter,
        }
    }

    pub async fn usage(&self, project_id: &str, user_id: Option<&str>, resource: &str) -> (i64, i64) {
        let scope = k1s0_quota_engine::UsageScope {
            project_id: project_id.to_string(),
            user_id: user_id.map(str::to_string),
        };
        let usage = self
            .store
            .get_usage(&scope, resource)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no usage row for {resource}"));
        (usage.in_use, usage.reserved)
    }
}

/// Driver that records every call and returns fixed values.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    registry_sizes: Mutex<Vec<usize>>,
}

impl RecordingDriver {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Size of the registry passed with each call that takes one.
    pub fn registry_sizes(&self) -> Vec<usize> {
        self.registry_sizes.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn record_with(&self, call: &str, resources: &ResourceRegistry) {
        self.record(call);
        self.registry_sizes.lock().unwrap().push(resources.len());
    }
}

#[async_trait]
impl QuotaDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn registered_default(&self, _resource: &Resource) -> i64 {
        -1
    }

    async fn get_by_project(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        self.record("get_by_project");
        Ok(5)
    }

    async fn get_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _user_id: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        self.record("get_by_project_and_user");
        Ok(3)
    }

    async fn get_by_class(
        &self,
        _ctx: &QuotaContext,
        _quota_class: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        self.record("get_by_class");
        Ok(7)
    }

    async fn get_defaults(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
    ) -> Result<QuotaMap, QuotaError> {
        self.record_with("get_defaults", resources);
        Ok(QuotaMap::new())
    }

    async fn get_class_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _quota_class: &str,
        _defaults: bool,
    ) -> Result<QuotaMap, QuotaError> {
        self.record_with("get_class_quotas", resources);
        Ok(QuotaMap::new())
    }

    async fn get_user_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        _user_id: &str,
        _query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        self.record_with("get_user_quotas", resources);
        Ok(BTreeMap::new())
    }

    async fn get_project_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        _query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        self.record_with("get_project_quotas", resources);
        Ok(BTreeMap::new())
    }

    async fn get_settable_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        _user_id: Option<&str>,
    ) -> Result<BTreeMap<String, SettableQuota>, QuotaError> {
        self.record_with("get_settable_quotas", resources);
        Ok(BTreeMap::new())
    }

    async fn limit_check(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _values: &QuotaMap,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.record_with("limit_check", resources);
        Ok(())
    }

    async fn limit_check_project_and_user(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_values: Option<&QuotaMap>,
        _user_values: Option<&QuotaMap>,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.record_with("limit_check_project_and_user", resources);
        Ok(())
    }

    async fn reserve(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _deltas: &QuotaMap,
        expire: Option<Expiration>,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<Vec<Reservation>, QuotaError> {
        self.record_with("reserve", resources);
        if let Some(expire) = expire {
            expire.resolve(start_time())?;
        }
        Ok(Vec::new())
    }

    async fn commit(
        &self,
        _ctx: &QuotaContext,
        _reservations: &[Reservation],
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.record("commit");
        Ok(())
    }

    async fn rollback(
        &self,
        _ctx: &QuotaContext,
        _reservations: &[Reservation],
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.record("rollback");
        Ok(())
    }

    async fn usage_reset(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _resource_names: &[String],
    ) -> Result<(), QuotaError> {
        self.record_with("usage_reset", resources);
        Ok(())
    }

    async fn usage_refresh(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
        _resource_names: Option<&[String]>,
    ) -> Result<(), QuotaError> {
        self.record_with("usage_refresh", resources);
        Ok(())
    }

    async fn destroy_all_by_project(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
    ) -> Result<(), QuotaError> {
        self.record("destroy_all_by_project");
        Ok(())
    }

    async fn destroy_all_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _user_id: &str,
    ) -> Result<(), QuotaError> {
        self.record("destroy_all_by_project_and_user");
        Ok(())
    }

    async fn expire(&self, _ctx: &QuotaContext) -> Result<usize, QuotaError> {
        self.record("expire");
        Ok(0)
    }
}
