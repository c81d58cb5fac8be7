pub mod db;
pub mod noop;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::config::QuotaConfig;
use crate::context::QuotaContext;
use crate::error::QuotaError;
use crate::expiration::Expiration;
use crate::model::{QuotaDetail, QuotaMap, QuotaQuery, Reservation, SettableQuota};
use crate::registry::ResourceRegistry;
use crate::resource::Resource;
use crate::store::QuotaStore;

pub use db::DbQuotaDriver;
pub use noop::NoopQuotaDriver;

/// QuotaDriver はクォータ操作一式を実装するバックエンドを表す。
///
/// Every operation that takes a registry receives the full set of registered
/// resources, not only the ones named in the call.
#[async_trait]
pub trait QuotaDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configured default for the resource, used when no override applies.
    fn registered_default(&self, resource: &Resource) -> i64;

    async fn get_by_project(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError>;

    async fn get_by_project_and_user(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError>;

    async fn get_by_class(
        &self,
        ctx: &QuotaContext,
        quota_class: &str,
        resource: &str,
    ) -> Result<i64, QuotaError>;

    async fn get_defaults(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
    ) -> Result<QuotaMap, QuotaError>;

    async fn get_class_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        quota_class: &str,
        defaults: bool,
    ) -> Result<QuotaMap, QuotaError>;

    async fn get_user_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError>;

    async fn get_project_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError>;

    async fn get_settable_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<BTreeMap<String, SettableQuota>, QuotaError>;

    async fn limit_check(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        values: &QuotaMap,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError>;

    async fn limit_check_project_and_user(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_values: Option<&QuotaMap>,
        user_values: Option<&QuotaMap>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError>;

    async fn reserve(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        deltas: &QuotaMap,
        expire: Option<Expiration>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Vec<Reservation>, QuotaError>;

    async fn commit(
        &self,
        ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError>;

    async fn rollback(
        &self,
        ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError>;

    async fn usage_reset(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        resource_names: &[String],
    ) -> Result<(), QuotaError>;

    async fn usage_refresh(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: Option<&str>,
        user_id: Option<&str>,
        resource_names: Option<&[String]>,
    ) -> Result<(), QuotaError>;

    async fn destroy_all_by_project(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
    ) -> Result<(), QuotaError>;

    async fn destroy_all_by_project_and_user(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError>;

    /// Returns the number of reservations swept.
    async fn expire(&self, ctx: &QuotaContext) -> Result<usize, QuotaError>;
}

/// What a driver constructor receives.
#[derive(Clone)]
pub struct DriverDeps {
    pub config: QuotaConfig,
    pub store: Arc<dyn QuotaStore>,
    pub clock: Arc<dyn Clock>,
}

impl DriverDeps {
    pub fn new(config: QuotaConfig, store: Arc<dyn QuotaStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub type DriverConstructor = Arc<dyn Fn(&DriverDeps) -> Arc<dyn QuotaDriver> + Send + Sync>;

/// DriverRegistry はドライバー識別子からコンストラクタへの対応を保持する。
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"db"` and `"noop"` preregistered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DbQuotaDriver::NAME, |deps: &DriverDeps| {
            Arc::new(DbQuotaDriver::with_clock(
                deps.store.clone(),
                deps.config.clone(),
                deps.clock.clone(),
            )) as Arc<dyn QuotaDriver>
        });
        registry.register(NoopQuotaDriver::NAME, |_: &DriverDeps| {
            Arc::new(NoopQuotaDriver) as Arc<dyn QuotaDriver>
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverDeps) -> Arc<dyn QuotaDriver> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn build(&self, name: &str, deps: &DriverDeps) -> Result<Arc<dyn QuotaDriver>, QuotaError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| QuotaError::UnknownDriver(name.to_string()))?;
        Ok(constructor(deps))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
