use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::QuotaContext;
use crate::driver::QuotaDriver;
use crate::error::QuotaError;
use crate::model::LimitLookup;

/// Level at which a sync function reports usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// Shared by every user of the project (e.g. floating address pools).
    Project,
    User,
}

impl SyncScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncScope::Project => "project",
            SyncScope::User => "user",
        }
    }
}

/// UsageSync は Reservable リソースの正確な使用量を再計算する所有者提供の関数。
///
/// Implementations must be idempotent: a reservation may call them more than once
/// across retried transactions. The returned map may cover several resources;
/// every pending resource it reports is refreshed from that single call.
#[async_trait]
pub trait UsageSync: Send + Sync {
    fn scope(&self) -> SyncScope;

    async fn sync(
        &self,
        ctx: &QuotaContext,
        project_id: &str,
        user_id: Option<&str>,
    ) -> anyhow::Result<HashMap<String, i64>>;
}

/// Arguments handed to a counting function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountScope {
    pub project_id: String,
    pub user_id: Option<String>,
}

impl CountScope {
    pub fn new(project_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id,
        }
    }
}

/// Per-scope counts returned by a counting function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedCounts {
    pub project: HashMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<HashMap<String, i64>>,
}

impl ScopedCounts {
    /// Count at the requested level, falling back to the project count.
    pub fn get(&self, resource: &str, user_level: bool) -> Option<i64> {
        if user_level {
            if let Some(count) = self.user.as_ref().and_then(|m| m.get(resource)) {
                return Some(*count);
            }
        }
        self.project.get(resource).copied()
    }
}

/// UsageCount は Countable リソースの使用量をその場で数える所有者提供の関数。
#[async_trait]
pub trait UsageCount: Send + Sync {
    async fn count(&self, ctx: &QuotaContext, scope: &CountScope) -> anyhow::Result<ScopedCounts>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Absolute,
    Countable,
    Reservable,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Absolute => "absolute",
            ResourceKind::Countable => "countable",
            ResourceKind::Reservable => "reservable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteResource {
    pub name: String,
    pub flag: Option<String>,
}

#[derive(Clone)]
pub struct CountableResource {
    pub name: String,
    pub flag: Option<String>,
    pub counter: Arc<dyn UsageCount>,
    /// Whether the live count is merged into usage displays.
    pub report_usage: bool,
}

#[derive(Clone)]
pub struct ReservableResource {
    pub name: String,
    pub flag: Option<String>,
    pub sync: Arc<dyn UsageSync>,
}

impl fmt::Debug for CountableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountableResource")
            .field("name", &self.name)
            .field("flag", &self.flag)
            .field("report_usage", &self.report_usage)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ReservableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservableResource")
            .field("name", &self.name)
            .field("flag", &self.flag)
            .field("scope", &self.sync.scope())
            .finish_non_exhaustive()
    }
}

/// Resource はクォータ管理対象のリソース定義を表す。登録後は不変。
#[derive(Debug, Clone)]
pub enum Resource {
    Absolute(AbsoluteResource),
    Countable(CountableResource),
    Reservable(ReservableResource),
}

impl Resource {
    pub fn absolute(name: impl Into<String>, flag: Option<&str>) -> Self {
        Resource::Absolute(AbsoluteResource {
            name: name.into(),
            flag: flag.map(str::to_string),
        })
    }

    pub fn countable(
        name: impl Into<String>,
        counter: Arc<dyn UsageCount>,
        flag: Option<&str>,
    ) -> Self {
        Resource::Countable(CountableResource {
            name: name.into(),
            flag: flag.map(str::to_string),
            counter,
            report_usage: true,
        })
    }

    /// A countable resource enforced only through `limit_check`; its usage reads as zero.
    pub fn countable_check_only(
        name: impl Into<String>,
        counter: Arc<dyn UsageCount>,
        flag: Option<&str>,
    ) -> Self {
        Resource::Countable(CountableResource {
            name: name.into(),
            flag: flag.map(str::to_string),
            counter,
            report_usage: false,
        })
    }

    pub fn reservable(
        name: impl Into<String>,
        sync: Arc<dyn UsageSync>,
        flag: Option<&str>,
    ) -> Self {
        Resource::Reservable(ReservableResource {
            name: name.into(),
            flag: flag.map(str::to_string),
            sync,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Absolute(r) => &r.name,
            Resource::Countable(r) => &r.name,
            Resource::Reservable(r) => &r.name,
        }
    }

    pub fn flag(&self) -> Option<&str> {
        match self {
            Resource::Absolute(r) => r.flag.as_deref(),
            Resource::Countable(r) => r.flag.as_deref(),
            Resource::Reservable(r) => r.flag.as_deref(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Absolute(_) => ResourceKind::Absolute,
            Resource::Countable(_) => ResourceKind::Countable,
            Resource::Reservable(_) => ResourceKind::Reservable,
        }
    }

    pub fn as_reservable(&self) -> Option<&ReservableResource> {
        match self {
            Resource::Reservable(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_countable(&self) -> Option<&CountableResource> {
        match self {
            Resource::Countable(r) => Some(r),
            _ => None,
        }
    }

    /// Sync scope for reservable resources, `None` otherwise.
    pub fn sync_scope(&self) -> Option<SyncScope> {
        self.as_reservable().map(|r| r.sync.scope())
    }

    /// Effective limit: project+user override, project override, quota class,
    /// then the registered default.
    ///
    /// A missing override at one level falls through to the next; any other
    /// driver error is returned as is.
    pub async fn quota(
        &self,
        driver: &dyn QuotaDriver,
        ctx: &QuotaContext,
        lookup: &LimitLookup,
    ) -> Result<i64, QuotaError> {
        let project_id = lookup.project_id.as_deref().or(ctx.project_id.as_deref());
        let user_id = lookup.user_id.as_deref().or(ctx.user_id.as_deref());
        let quota_class = lookup.quota_class.as_deref().or(ctx.quota_class.as_deref());

        if let (Some(project_id), Some(user_id)) = (project_id, user_id) {
            match driver
                .get_by_project_and_user(ctx, project_id, user_id, self.name())
                .await
            {
                Ok(limit) => return Ok(limit),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(project_id) = project_id {
            match driver.get_by_project(ctx, project_id, self.name()).await {
                Ok(limit) => return Ok(limit),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(quota_class) = quota_class {
            match driver.get_by_class(ctx, quota_class, self.name()).await {
                Ok(limit) => return Ok(limit),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(driver.registered_default(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCount;

    #[async_trait]
    impl UsageCount for NoCount {
        async fn count(
            &self,
            _ctx: &QuotaContext,
            _scope: &CountScope,
        ) -> anyhow::Result<ScopedCounts> {
            Ok(ScopedCounts::default())
        }
    }

    #[test]
    fn test_kind_and_accessors() {
        let r = Resource::countable_check_only("key_pairs", Arc::new(NoCount), Some("key_pairs"));
        assert_eq!(r.kind(), ResourceKind::Countable);
        assert_eq!(r.name(), "key_pairs");
        assert_eq!(r.flag(), Some("key_pairs"));
        assert!(r.as_reservable().is_none());
        assert!(!r.as_countable().map(|c| c.report_usage).unwrap_or(true));
    }

    #[test]
    fn test_scoped_counts_fall_back_to_project() {
        let counts = ScopedCounts {
            project: HashMap::from([("instances".to_string(), 4)]),
            user: Some(HashMap::from([("key_pairs".to_string(), 2)])),
        };
        assert_eq!(counts.get("key_pairs", true), Some(2));
        assert_eq!(counts.get("instances", true), Some(4));
        assert_eq!(counts.get("key_pairs", false), None);
    }
}
