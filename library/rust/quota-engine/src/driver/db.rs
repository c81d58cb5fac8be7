use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::config::QuotaConfig;
use crate::context::{AdminCapability, QuotaContext};
use crate::driver::QuotaDriver;
use crate::error::QuotaError;
use crate::expiration::Expiration;
use crate::model::{
    exceeds, OverQuotaDetail, QuotaDetail, QuotaMap, QuotaQuery, QuotaUsage, Reservation,
    SettableQuota, UsageSnapshot, UNLIMITED,
};
use crate::registry::{QuotaMethod, ResourceRegistry};
use crate::resource::{CountScope, Resource};
use crate::store::{QuotaStore, RefreshRequest, ReserveItem, ReserveRequest, SyncTarget, UsageScope};

/// Quota class whose stored limits replace configured defaults.
pub const DEFAULT_QUOTA_CLASS: &str = "default";

/// DbQuotaDriver は永続ストアを使ってクォータを管理するドライバー。
pub struct DbQuotaDriver {
    store: Arc<dyn QuotaStore>,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
}

impl DbQuotaDriver {
    pub const NAME: &'static str = "db";

    pub fn new(store: Arc<dyn QuotaStore>, config: QuotaConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn QuotaStore>, config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Stored usage row for the resource.
    pub async fn get_usage(
        &self,
        project_id: &str,
        user_id: Option<&str>,
        resource: &str,
    ) -> Result<QuotaUsage, QuotaError> {
        let scope = UsageScope {
            project_id: project_id.to_string(),
            user_id: user_id.map(str::to_string),
        };
        self.store
            .get_usage(&scope, resource)
            .await?
            .ok_or_else(|| QuotaError::QuotaUsageNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// Explicit ids win; the user falls back to the context's user.
    fn resolve_scope(
        ctx: &QuotaContext,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(String, Option<String>), QuotaError> {
        let project_id = project_id
            .or(ctx.project_id.as_deref())
            .ok_or_else(|| QuotaError::InvalidInput("project_id is required".to_string()))?;
        let user_id = user_id.or(ctx.user_id.as_deref());
        Ok((project_id.to_string(), user_id.map(str::to_string)))
    }

    /// The context's class only applies to the context's own project.
    fn quota_class_for(ctx: &QuotaContext, project_id: &str, query: &QuotaQuery) -> Option<String> {
        query.quota_class.clone().or_else(|| {
            if ctx.owns_project(project_id) {
                ctx.quota_class.clone()
            } else {
                None
            }
        })
    }

    async fn class_overrides(&self, quota_class: Option<&str>) -> Result<QuotaMap, QuotaError> {
        match quota_class {
            Some(quota_class) => self.store.get_all_by_class(quota_class).await,
            None => Ok(QuotaMap::new()),
        }
    }

    /// Resolves each resource's limit from `overrides`, then the class, then defaults.
    fn process_limits(
        resources: &ResourceRegistry,
        overrides: &QuotaMap,
        class_quotas: &QuotaMap,
        default_quotas: &QuotaMap,
        defaults: bool,
    ) -> QuotaMap {
        resources
            .names()
            .filter(|name| defaults || overrides.contains_key(*name))
            .map(|name| {
                let limit = overrides
                    .get(name)
                    .or_else(|| class_quotas.get(name))
                    .or_else(|| default_quotas.get(name))
                    .copied()
                    .unwrap_or(UNLIMITED);
                (name.to_string(), limit)
            })
            .collect()
    }

    /// Live counts from counting functions that report usage.
    ///
    /// One counting function may report several resources; it is called once.
    async fn counted_usages(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        scope: &CountScope,
    ) -> Result<HashMap<String, i64>, QuotaError> {
        let user_level = scope.user_id.is_some();
        let reporting: Vec<_> = resources
            .iter()
            .filter_map(Resource::as_countable)
            .filter(|c| c.report_usage)
            .collect();

        let mut counted = HashMap::new();
        for countable in &reporting {
            if counted.contains_key(&countable.name) {
                continue;
            }
            let counts = countable
                .counter
                .count(ctx, scope)
                .await
                .map_err(|e| QuotaError::sync_failed(&countable.name, &e))?;
            for other in &reporting {
                if let Some(count) = counts.get(&other.name, user_level) {
                    counted.entry(other.name.clone()).or_insert(count);
                }
            }
            counted.entry(countable.name.clone()).or_insert(0);
        }
        Ok(counted)
    }

    /// Stored rows summed per resource, with counted usage replacing them.
    async fn merged_usages(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        rows: Vec<QuotaUsage>,
        scope: &CountScope,
    ) -> Result<BTreeMap<String, UsageSnapshot>, QuotaError> {
        let mut usages: BTreeMap<String, UsageSnapshot> = BTreeMap::new();
        for row in rows {
            let usage = usages.entry(row.resource).or_default();
            usage.in_use += row.in_use;
            usage.reserved += row.reserved;
        }
        for (name, count) in self.counted_usages(ctx, resources, scope).await? {
            usages.insert(
                name,
                UsageSnapshot {
                    in_use: count,
                    reserved: 0,
                },
            );
        }
        Ok(usages)
    }

    /// Σ of non-negative per-user overrides in the project, per resource.
    async fn user_allocations(&self, project_id: &str) -> Result<QuotaMap, QuotaError> {
        let mut allocated = QuotaMap::new();
        for quota in self.store.get_all_user_quotas(project_id).await? {
            if quota.hard_limit >= 0 {
                *allocated.entry(quota.resource).or_default() += quota.hard_limit;
            }
        }
        Ok(allocated)
    }

    fn details(
        limits: QuotaMap,
        usages: Option<&BTreeMap<String, UsageSnapshot>>,
        remains_base: Option<(&QuotaMap, &QuotaMap)>,
    ) -> BTreeMap<String, QuotaDetail> {
        limits
            .into_iter()
            .map(|(name, limit)| {
                let usage = usages.map(|u| u.get(&name).copied().unwrap_or_default());
                let remains = remains_base.map(|(project_limits, allocated)| {
                    let project_limit = project_limits.get(&name).copied().unwrap_or(limit);
                    if project_limit < 0 {
                        UNLIMITED
                    } else {
                        project_limit - allocated.get(&name).copied().unwrap_or(0)
                    }
                });
                let detail = QuotaDetail {
                    limit,
                    in_use: usage.map(|u| u.in_use),
                    reserved: usage.map(|u| u.reserved),
                    remains,
                };
                (name, detail)
            })
            .collect()
    }

    async fn project_limits(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        query: &QuotaQuery,
    ) -> Result<QuotaMap, QuotaError> {
        let overrides = self.store.get_all_by_project(project_id).await?;
        let quota_class = Self::quota_class_for(ctx, project_id, query);
        let class_quotas = self.class_overrides(quota_class.as_deref()).await?;
        let default_quotas = self.get_defaults(ctx, resources).await?;
        Ok(Self::process_limits(
            resources,
            &overrides,
            &class_quotas,
            &default_quotas,
            query.defaults,
        ))
    }

    async fn user_limits(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: &str,
        query: &QuotaQuery,
    ) -> Result<QuotaMap, QuotaError> {
        let mut overrides = self.store.get_all_by_project(project_id).await?;
        overrides.extend(
            self.store
                .get_all_by_project_and_user(project_id, user_id)
                .await?,
        );
        let quota_class = Self::quota_class_for(ctx, project_id, query);
        let class_quotas = self.class_overrides(quota_class.as_deref()).await?;
        let default_quotas = self.get_defaults(ctx, resources).await?;
        Ok(Self::process_limits(
            resources,
            &overrides,
            &class_quotas,
            &default_quotas,
            query.defaults,
        ))
    }

    /// Project limits and, when a user is in scope, that user's limits.
    async fn enforced_limits(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<(QuotaMap, Option<QuotaMap>), QuotaError> {
        let query = QuotaQuery::limits_only();
        let project = self.project_limits(ctx, resources, project_id, &query).await?;
        let user = match user_id {
            Some(user_id) => Some(
                self.user_limits(ctx, resources, project_id, user_id, &query)
                    .await?,
            ),
            None => None,
        };
        Ok((project, user))
    }

    fn check_values(
        values: &QuotaMap,
        limits: &QuotaMap,
        overs: &mut BTreeSet<String>,
        headroom: &mut QuotaMap,
    ) {
        for (name, &value) in values {
            let limit = limits.get(name).copied().unwrap_or(UNLIMITED);
            if exceeds(limit, value) {
                overs.insert(name.clone());
            }
            if limit >= 0 {
                let room = headroom.entry(name.clone()).or_insert(limit);
                *room = (*room).min(limit);
            }
        }
    }

    fn over_quota(overs: BTreeSet<String>, quotas: QuotaMap, mut headroom: QuotaMap) -> QuotaError {
        headroom.retain(|name, _| overs.contains(name));
        QuotaError::OverQuota(Box::new(OverQuotaDetail::new(
            overs.into_iter().collect(),
            quotas,
            BTreeMap::new(),
            headroom,
        )))
    }
}

fn unders(values: &QuotaMap) -> Vec<String> {
    values
        .iter()
        .filter(|(_, v)| **v < 0)
        .map(|(name, _)| name.clone())
        .collect()
}

#[async_trait]
impl QuotaDriver for DbQuotaDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn registered_default(&self, resource: &Resource) -> i64 {
        self.config.default_for(resource.flag())
    }

    async fn get_by_project(
        &self,
        _ctx: &QuotaContext,
        project_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.store
            .get_project_quota(project_id, resource)
            .await?
            .ok_or_else(|| QuotaError::ProjectQuotaNotFound {
                project_id: project_id.to_string(),
            })
    }

    async fn get_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.store
            .get_user_quota(project_id, user_id, resource)
            .await?
            .ok_or_else(|| QuotaError::ProjectUserQuotaNotFound {
                project_id: project_id.to_string(),
                user_id: user_id.to_string(),
            })
    }

    async fn get_by_class(
        &self,
        _ctx: &QuotaContext,
        quota_class: &str,
        resource: &str,
    ) -> Result<i64, QuotaError> {
        self.store
            .get_class_quota(quota_class, resource)
            .await?
            .ok_or_else(|| QuotaError::QuotaClassNotFound {
                class_name: quota_class.to_string(),
            })
    }

    async fn get_defaults(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
    ) -> Result<QuotaMap, QuotaError> {
        let stored = self.store.get_all_by_class(DEFAULT_QUOTA_CLASS).await?;
        Ok(resources
            .iter()
            .map(|resource| {
                let limit = stored
                    .get(resource.name())
                    .copied()
                    .unwrap_or_else(|| self.registered_default(resource));
                (resource.name().to_string(), limit)
            })
            .collect())
    }

    async fn get_class_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        quota_class: &str,
        defaults: bool,
    ) -> Result<QuotaMap, QuotaError> {
        let class_quotas = self.store.get_all_by_class(quota_class).await?;
        let default_quotas = if defaults {
            self.get_defaults(ctx, resources).await?
        } else {
            QuotaMap::new()
        };
        Ok(resources
            .names()
            .filter_map(|name| {
                class_quotas
                    .get(name)
                    .or_else(|| default_quotas.get(name))
                    .map(|&limit| (name.to_string(), limit))
            })
            .collect())
    }

    async fn get_user_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        let limits = self
            .user_limits(ctx, resources, project_id, user_id, query)
            .await?;
        let usages = if query.usages {
            let rows = self
                .store
                .get_usages_by_project_and_user(project_id, user_id)
                .await?;
            let scope = CountScope::new(project_id, Some(user_id.to_string()));
            Some(self.merged_usages(ctx, resources, rows, &scope).await?)
        } else {
            None
        };
        let remains = if query.remains {
            let project_limits = self
                .project_limits(ctx, resources, project_id, &QuotaQuery::limits_only())
                .await?;
            Some((project_limits, self.user_allocations(project_id).await?))
        } else {
            None
        };
        Ok(Self::details(
            limits,
            usages.as_ref(),
            remains.as_ref().map(|(p, a)| (p, a)),
        ))
    }

    async fn get_project_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        let limits = self
            .project_limits(ctx, resources, project_id, query)
            .await?;
        let usages = if query.usages {
            let rows = self.store.get_usages_by_project(project_id).await?;
            let scope = CountScope::new(project_id, None);
            Some(self.merged_usages(ctx, resources, rows, &scope).await?)
        } else {
            None
        };
        let allocated = if query.remains {
            Some(self.user_allocations(project_id).await?)
        } else {
            None
        };
        let project_limits = limits.clone();
        Ok(Self::details(
            limits,
            usages.as_ref(),
            allocated.as_ref().map(|a| (&project_limits, a)),
        ))
    }

    async fn get_settable_quotas(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<BTreeMap<String, SettableQuota>, QuotaError> {
        let project = self
            .get_project_quotas(ctx, resources, project_id, &QuotaQuery::default().with_remains())
            .await?;

        let Some(user_id) = user_id else {
            let quota_class = Self::quota_class_for(ctx, project_id, &QuotaQuery::default());
            let ceilings = match quota_class {
                Some(quota_class) => {
                    self.get_class_quotas(ctx, resources, &quota_class, true)
                        .await?
                }
                None => self.get_defaults(ctx, resources).await?,
            };
            return Ok(project
                .into_iter()
                .map(|(name, detail)| {
                    let allocated = match detail.remains {
                        Some(remains) if detail.limit >= 0 => detail.limit - remains,
                        _ => 0,
                    };
                    let minimum = detail.consumed().max(allocated).max(0);
                    let ceiling = ceilings.get(&name).copied().unwrap_or(UNLIMITED);
                    let maximum = if ceiling < 0 {
                        UNLIMITED
                    } else {
                        ceiling.max(minimum)
                    };
                    (name, SettableQuota { minimum, maximum })
                })
                .collect());
        };

        let user = self
            .get_user_quotas(ctx, resources, project_id, user_id, &QuotaQuery::default())
            .await?;
        let user_overrides = self
            .store
            .get_all_by_project_and_user(project_id, user_id)
            .await?;
        Ok(project
            .into_iter()
            .map(|(name, detail)| {
                let minimum = user.get(&name).map_or(0, QuotaDetail::consumed).max(0);
                let remains = detail.remains.unwrap_or(UNLIMITED);
                let maximum = if remains < 0 {
                    UNLIMITED
                } else {
                    let current = user_overrides.get(&name).copied().unwrap_or(0).max(0);
                    remains + current
                };
                (name, SettableQuota { minimum, maximum })
            })
            .collect())
    }

    async fn limit_check(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        values: &QuotaMap,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        let unders = unders(values);
        if !unders.is_empty() {
            return Err(QuotaError::InvalidQuotaValue { unders });
        }
        resources.require_known(values.keys().map(String::as_str))?;
        let (project_id, user_id) = Self::resolve_scope(ctx, project_id, user_id)?;
        let (project_limits, user_limits) = self
            .enforced_limits(ctx, resources, &project_id, user_id.as_deref())
            .await?;

        let mut overs = BTreeSet::new();
        let mut headroom = QuotaMap::new();
        Self::check_values(values, &project_limits, &mut overs, &mut headroom);
        if let Some(user_limits) = &user_limits {
            Self::check_values(values, user_limits, &mut overs, &mut headroom);
        }
        if overs.is_empty() {
            return Ok(());
        }
        let quotas = user_limits.unwrap_or(project_limits);
        Err(Self::over_quota(overs, quotas, headroom))
    }

    async fn limit_check_project_and_user(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_values: Option<&QuotaMap>,
        user_values: Option<&QuotaMap>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        let mut project_values = project_values.cloned().unwrap_or_default();
        let mut user_values = user_values.cloned().unwrap_or_default();
        if project_values.is_empty() && user_values.is_empty() {
            return Err(QuotaError::InvalidInput(
                "must specify project_values or user_values".to_string(),
            ));
        }

        // A value given at only one level is checked at both.
        for (name, &value) in &project_values {
            user_values.entry(name.clone()).or_insert(value);
        }
        for (name, &value) in &user_values {
            project_values.entry(name.clone()).or_insert(value);
        }

        let mut invalid: BTreeSet<String> = unders(&project_values).into_iter().collect();
        invalid.extend(unders(&user_values));
        if !invalid.is_empty() {
            return Err(QuotaError::InvalidQuotaValue {
                unders: invalid.into_iter().collect(),
            });
        }
        resources.require_known(project_values.keys().map(String::as_str))?;

        let (project_id, user_id) = Self::resolve_scope(ctx, project_id, user_id)?;
        let (project_limits, user_limits) = self
            .enforced_limits(ctx, resources, &project_id, user_id.as_deref())
            .await?;

        let mut overs = BTreeSet::new();
        let mut headroom = QuotaMap::new();
        Self::check_values(&project_values, &project_limits, &mut overs, &mut headroom);
        if let Some(user_limits) = &user_limits {
            Self::check_values(&user_values, user_limits, &mut overs, &mut headroom);
        }
        if overs.is_empty() {
            return Ok(());
        }
        let quotas = user_limits.unwrap_or(project_limits);
        Err(Self::over_quota(overs, quotas, headroom))
    }

    async fn reserve(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        deltas: &QuotaMap,
        expire: Option<Expiration>,
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Vec<Reservation>, QuotaError> {
        let now = self.clock.now();
        let expire = expire
            .unwrap_or(Expiration::Seconds(self.config.reservation_expire_seconds))
            .resolve(now)?;
        resources.validate(QuotaMethod::Reserve, deltas.keys().map(String::as_str))?;
        let (project_id, user_id) = Self::resolve_scope(ctx, project_id, user_id)?;
        let (project_limits, user_limits) = self
            .enforced_limits(ctx, resources, &project_id, user_id.as_deref())
            .await?;

        let items = deltas
            .iter()
            .filter_map(|(name, &delta)| {
                let reservable = resources.get(name)?.as_reservable()?;
                let project_limit = project_limits.get(name).copied().unwrap_or(UNLIMITED);
                let user_limit = user_limits
                    .as_ref()
                    .and_then(|limits| limits.get(name).copied())
                    .unwrap_or(project_limit);
                Some(ReserveItem {
                    target: SyncTarget::new(name.clone(), reservable.sync.clone()),
                    delta,
                    project_limit,
                    user_limit,
                })
            })
            .collect();

        let request = ReserveRequest {
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            items,
            expire,
            until_refresh: self.config.until_refresh(),
            max_age: self.config.max_age(),
            now,
        };
        let reservations = self.store.reserve(ctx, request).await?;
        tracing::debug!(
            project_id = %project_id,
            user_id = ?user_id,
            count = reservations.len(),
            expire = %expire,
            "created reservations"
        );
        Ok(reservations)
    }

    async fn commit(
        &self,
        _ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        let committed = self.store.commit(reservations).await?;
        tracing::debug!(project_id = ?project_id, user_id = ?user_id, committed, "committed reservations");
        Ok(())
    }

    async fn rollback(
        &self,
        _ctx: &QuotaContext,
        reservations: &[Reservation],
        project_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        let rolled_back = self.store.rollback(reservations).await?;
        tracing::debug!(project_id = ?project_id, user_id = ?user_id, rolled_back, "rolled back reservations");
        Ok(())
    }

    async fn usage_reset(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        resource_names: &[String],
    ) -> Result<(), QuotaError> {
        let project_id = ctx
            .project_id
            .as_deref()
            .ok_or_else(|| QuotaError::InvalidInput("project_id is required".to_string()))?;
        let admin = AdminCapability::grant();

        let mut reset = 0;
        for name in resource_names {
            let Some(scope) = resources.get(name).and_then(Resource::sync_scope) else {
                continue;
            };
            let key = UsageScope::for_sync(project_id, ctx.user_id.as_deref(), scope);
            if self.store.reset_usage(&admin, &key, name).await? {
                reset += 1;
            }
        }
        tracing::info!(project_id = %project_id, user_id = ?ctx.user_id, reset, "usage reset");
        Ok(())
    }

    async fn usage_refresh(
        &self,
        ctx: &QuotaContext,
        resources: &ResourceRegistry,
        project_id: Option<&str>,
        user_id: Option<&str>,
        resource_names: Option<&[String]>,
    ) -> Result<(), QuotaError> {
        let (project_id, user_id) = match project_id {
            Some(project_id) => (project_id.to_string(), user_id.map(str::to_string)),
            None => {
                let project_id = ctx.project_id.clone().ok_or_else(|| {
                    QuotaError::InvalidInput("project_id is required".to_string())
                })?;
                (project_id, ctx.user_id.clone())
            }
        };
        let names = resources.refresh_targets(&project_id, user_id.as_deref(), resource_names)?;
        let targets: Vec<SyncTarget> = names
            .iter()
            .filter_map(|name| {
                let reservable = resources.get(name)?.as_reservable()?;
                Some(SyncTarget::new(name.clone(), reservable.sync.clone()))
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let request = RefreshRequest {
            project_id: project_id.clone(),
            user_id: user_id.clone(),
            targets,
            until_refresh: self.config.until_refresh(),
            now: self.clock.now(),
        };
        self.store.refresh_usage(ctx, request).await?;
        tracing::info!(project_id = %project_id, user_id = ?user_id, resources = ?names, "usage refreshed");
        Ok(())
    }

    async fn destroy_all_by_project(
        &self,
        _ctx: &QuotaContext,
        project_id: &str,
    ) -> Result<(), QuotaError> {
        self.store.destroy_all_by_project(project_id).await?;
        tracing::info!(project_id = %project_id, "destroyed project quotas");
        Ok(())
    }

    async fn destroy_all_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError> {
        self.store
            .destroy_all_by_project_and_user(project_id, user_id)
            .await?;
        tracing::info!(project_id = %project_id, user_id = %user_id, "destroyed user quotas");
        Ok(())
    }

    async fn expire(&self, _ctx: &QuotaContext) -> Result<usize, QuotaError> {
        let expired = self.store.expire(self.clock.now()).await?;
        if expired > 0 {
            tracing::info!(expired, "expired reservations rolled back");
        }
        Ok(expired)
    }
}
