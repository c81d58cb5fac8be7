use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::QuotaConfig;
use crate::context::QuotaContext;
use crate::driver::{DbQuotaDriver, DriverDeps, DriverRegistry, QuotaDriver};
use crate::error::QuotaError;
use crate::expiration::Expiration;
use crate::model::{LimitLookup, QuotaDetail, QuotaMap, QuotaQuery, Reservation, SettableQuota};
use crate::registry::{QuotaMethod, ResourceRegistry};
use crate::resource::{CountScope, Resource, ScopedCounts};
use crate::store::QuotaStore;

/// QuotaEngine はリソース定義とドライバーを束ねるファサード。
///
/// Resources are registered once at startup, before the engine is shared.
/// Each call validates the resources it names against the method table and
/// forwards to the driver together with the full registry.
pub struct QuotaEngine {
    driver: Arc<dyn QuotaDriver>,
    resources: ResourceRegistry,
}

impl QuotaEngine {
    pub fn new(driver: Arc<dyn QuotaDriver>) -> Self {
        Self {
            driver,
            resources: ResourceRegistry::new(),
        }
    }

    /// Engine backed by the persisted driver.
    pub fn persisted(store: Arc<dyn QuotaStore>, config: QuotaConfig) -> Self {
        Self::new(Arc::new(DbQuotaDriver::new(store, config)))
    }

    /// Builds the driver named by `config.driver` from the builtin drivers.
    pub fn from_config(config: QuotaConfig, store: Arc<dyn QuotaStore>) -> Result<Self, QuotaError> {
        Self::from_registry(&DriverRegistry::with_builtins(), DriverDeps::new(config, store))
    }

    pub fn from_registry(drivers: &DriverRegistry, deps: DriverDeps) -> Result<Self, QuotaError> {
        let driver = drivers.build(&deps.config.driver, &deps)?;
        tracing::info!(driver = driver.name(), "quota engine initialized");
        Ok(Self::new(driver))
    }

    pub fn driver(&self) -> &Arc<dyn QuotaDriver> {
        &self.driver
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn register_resource(&mut self, resource: Resource) -> Result<(), QuotaError> {
        self.resources.register(resource)
    }

    pub fn register_resources(
        &mut self,
        resources: impl IntoIterator<Item = Resource>,
    ) -> Result<(), QuotaError> {
        self.resources.register_many(resources)
    }

    /// Effective limit of one registered resource.
    pub async fn quota(
        &self,
        ctx: &QuotaContext,
        resource: &str,
        lookup: &LimitLookup,
    ) -> Result<i64, QuotaError> {
        let resource = self.resources.get(resource).ok_or_else(|| QuotaError::ResourceUnknown {
            resources: vec![resource.to_string()],
        })?;
        resource.quota(self.driver.as_ref(), ctx, lookup).await
    }

    pub async fn get_by_project(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.driver.get_by_project(ctx, project_id, resource).await
    }

    pub async fn get_by_project_and_user(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.driver
            .get_by_project_and_user(ctx, project_id, user_id, resource)
            .await
    }

    pub async fn get_by_class(
        &self,
        ctx: &QuotaContext,
        quota_class: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.driver.get_by_class(ctx, quota_class, resource).await
    }

    pub async fn get_defaults(&self, ctx: &QuotaContext) -> Result<QuotaMap, QuotaError> {
        self.driver.get_defaults(ctx, &self.resources).await
    }

    pub async fn get_class_quotas(
        &self,
        ctx: &QuotaContext,
        quota_class: &str,
        defaults: bool,
    ) -> Result<QuotaMap, QuotaError> {
        self.driver
            .get_class_quotas(ctx, &self.resources, quota_class, defaults)
            .await
    }

    pub async fn get_user_quotas(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        self.driver
            .get_user_quotas(ctx, &self.resources, project_id, user_id, query)
            .await
    }

    pub async fn get_project_quotas(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        self.driver
            .get_project_quotas(ctx, &self.resources, project_id, query)
            .await
    }

    pub async fn get_settable_quotas(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<BTreeMap<String, SettableQuota>, QuotaError> {
        self.driver
            .get_settable_quotas(ctx, &self.resources, project_id, user_id)
            .await
    }

    /// Runs the resource's counting function and returns its raw counts.
    pub async fn count_as_dict(
        &self,
        ctx: &QuotaContext,
        resource: &str,
        scope: &CountScope,
    ) -> Result<ScopedCounts, QuotaError> {
        let countable = self
            .resources
            .get(resource)
            .and_then(Resource::as_countable)
            .ok_or_else(|| QuotaError::ResourceUnknown {
                resources: vec![resource.to_string()],
            })?;
        countable
            .counter
            .count(ctx, scope)
            .await
            .map_err(|e| QuotaError::sync_failed(resource, &e))
    }

    pub async fn limit_check(
        &self,
        ctx: &QuotaContext,
        values: &QuotaMap,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.resources
            .validate(QuotaMethod::Check, values.keys().map(String::as_str))?;
        self.driver
            .limit_check(ctx, &self.resources, values, project_id, user_id)
            .await
    }

    pub async fn limit_check_project_and_user(
        &self,
        ctx: &QuotaContext,
        project_values: Option<&QuotaMap>,
        user_values: Option<&QuotaMap>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        let names = project_values
            .into_iter()
            .chain(user_values)
            .flat_map(|values| values.keys().map(String::as_str));
        self.resources.validate(QuotaMethod::Check, names)?;
        self.driver
            .limit_check_project_and_user(
                ctx,
                &self.resources,
                project_values,
                user_values,
                project_id,
                user_id,
            )
            .await
    }

    pub async fn reserve(
        &self,
        ctx: &QuotaContext,
        deltas: &QuotaMap,
        expire: Option<Expiration>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Vec<Reservation>, QuotaError> {
        self.resources
            .validate(QuotaMethod::Reserve, deltas.keys().map(String::as_str))?;
        self.driver
            .reserve(ctx, &self.resources, deltas, expire, project_id, user_id)
            .await
    }

    pub async fn commit(
        &self,
        ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.resources.validate(
            QuotaMethod::Commit,
            reservations.iter().map(|r| r.resource.as_str()),
        )?;
        self.driver
            .commit(ctx, reservations, project_id, user_id)
            .await
    }

    pub async fn rollback(
        &self,
        ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        self.resources.validate(
            QuotaMethod::Rollback,
            reservations.iter().map(|r| r.resource.as_str()),
        )?;
        self.driver
            .rollback(ctx, reservations, project_id, user_id)
            .await
    }

    /// Forces the next reservation of each resource to resync.
    pub async fn usage_reset(
        &self,
        ctx: &QuotaContext,
        resource_names: &[String],
    ) -> Result<(), QuotaError> {
        self.resources
            .require_known(resource_names.iter().map(String::as_str))?;
        self.driver
            .usage_reset(ctx, &self.resources, resource_names)
            .await
    }

    /// Resyncs usage now. An invalid name fails the call before any resource
    /// is refreshed.
    pub async fn usage_refresh(
        &self,
        ctx: &QuotaContext,
        project_id: Option<&str>,
        user_id: Option<&str>,
        resource_names: Option<&[String]>,
    ) -> Result<(), QuotaError> {
        let (scope_project, scope_user) = match project_id {
            Some(project_id) => (Some(project_id), user_id),
            None => (ctx.project_id.as_deref(), ctx.user_id.as_deref()),
        };
        let scope_project = scope_project
            .ok_or_else(|| QuotaError::InvalidInput("project_id is required".to_string()))?;
        self.resources
            .refresh_targets(scope_project, scope_user, resource_names)?;
        self.driver
            .usage_refresh(ctx, &self.resources, project_id, user_id, resource_names)
            .await
    }

    pub async fn destroy_all_by_project(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
    ) -> Result<(), QuotaError> {
        self.driver.destroy_all_by_project(ctx, project_id).await
    }

    pub async fn destroy_all_by_project_and_user(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError> {
        self.driver
            .destroy_all_by_project_and_user(ctx, project_id, user_id)
            .await
    }

    pub async fn expire(&self, ctx: &QuotaContext) -> Result<usize, QuotaError> {
        self.driver.expire(ctx).await
    }
}
