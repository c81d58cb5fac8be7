use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::context::QuotaContext;
use crate::driver::QuotaDriver;
use crate::error::QuotaError;
use crate::expiration::Expiration;
use crate::model::{QuotaDetail, QuotaMap, QuotaQuery, Reservation, SettableQuota, UNLIMITED};
use crate::registry::ResourceRegistry;
use crate::resource::Resource;

/// NoopQuotaDriver はクォータ制御を無効化したときに使うドライバー。
///
/// Every limit reads as unlimited and every enforcement call succeeds
/// without touching storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQuotaDriver;

impl NoopQuotaDriver {
    pub const NAME: &'static str = "noop";
}

fn unlimited(resources: &ResourceRegistry) -> QuotaMap {
    resources
        .names()
        .map(|name| (name.to_string(), UNLIMITED))
        .collect()
}

fn unlimited_details(resources: &ResourceRegistry, query: &QuotaQuery) -> BTreeMap<String, QuotaDetail> {
    resources
        .names()
        .map(|name| {
            let detail = QuotaDetail {
                limit: UNLIMITED,
                in_use: query.usages.then_some(UNLIMITED),
                reserved: query.usages.then_some(UNLIMITED),
                remains: query.remains.then_some(UNLIMITED),
            };
            (name.to_string(), detail)
        })
        .collect()
}

#[async_trait]
impl QuotaDriver for NoopQuotaDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn registered_default(&self, _resource: &Resource) -> i64 {
        UNLIMITED
    }

    async fn get_by_project(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        Ok(UNLIMITED)
    }

    async fn get_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _user_id: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        Ok(UNLIMITED)
    }

    async fn get_by_class(
        &self,
        _ctx: &QuotaContext,
        _quota_class: &str,
        _resource: &str,
    ) -> Result<i64, QuotaError> {
        Ok(UNLIMITED)
    }

    async fn get_defaults(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
    ) -> Result<QuotaMap, QuotaError> {
        Ok(unlimited(resources))
    }

    async fn get_class_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _quota_class: &str,
        _defaults: bool,
    ) -> Result<QuotaMap, QuotaError> {
        Ok(unlimited(resources))
    }

    async fn get_user_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        _user_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        Ok(unlimited_details(resources, query))
    }

    async fn get_project_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        query: &QuotaQuery,
    ) -> Result<BTreeMap<String, QuotaDetail>, QuotaError> {
        Ok(unlimited_details(resources, query))
    }

    async fn get_settable_quotas(
        &self,
        _ctx: &QuotaContext,
        resources: &ResourceRegistry,
        _project_id: &str,
        _user_id: Option<&str>,
    ) -> Result<BTreeMap<String, SettableQuota>, QuotaError> {
        Ok(resources
            .names()
            .map(|name| {
                let bounds = SettableQuota {
                    minimum: 0,
                    maximum: UNLIMITED,
                };
                (name.to_string(), bounds)
            })
            .collect())
    }

    async fn limit_check(
        &self,
        _ctx: &QuotaContext,
        _resources: &ResourceRegistry,
        _values: &QuotaMap,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn limit_check_project_and_user(
        &self,
        _ctx: &QuotaContext,
        _resources: &ResourceRegistry,
        _project_values: Option<&QuotaMap>,
        _user_values: Option<&QuotaMap>,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn reserve(
        &self,
        _ctx: &QuotaContext,
        _resources: &ResourceRegistry,
        _deltas: &QuotaMap,
        _expire: Option<Expiration>,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<Vec<Reservation>, QuotaError> {
        Ok(Vec::new())
    }

    async fn commit(
        &self,
        _ctx: &QuotaContext,
        _reservations: &[Reservation],
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn rollback(
        &self,
        _ctx: &QuotaContext,
        _reservations: &[Reservation],
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn usage_reset(
        &self,
        _ctx: &QuotaContext,
        _resources: &ResourceRegistry,
        _resource_names: &[String],
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn usage_refresh(
        &self,
        _ctx: &QuotaContext,
        _resources: &ResourceRegistry,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
        _resource_names: Option<&[String]>,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn destroy_all_by_project(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn destroy_all_by_project_and_user(
        &self,
        _ctx: &QuotaContext,
        _project_id: &str,
        _user_id: &str,
    ) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn expire(&self, _ctx: &QuotaContext) -> Result<usize, QuotaError> {
        Ok(0)
    }
}
