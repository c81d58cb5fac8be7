use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::context::{AdminCapability, QuotaContext};
use crate::error::QuotaError;
use crate::model::{QuotaMap, QuotaUsage, Reservation, UserQuota};
use crate::resource::{SyncScope, UsageSync};

/// Key of a usage row: project-scoped rows carry no user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageScope {
    pub project_id: String,
    pub user_id: Option<String>,
}

impl UsageScope {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: None,
        }
    }

    pub fn user(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Row key for a resource synced at `scope`.
    pub fn for_sync(project_id: &str, user_id: Option<&str>, scope: SyncScope) -> Self {
        match scope {
            SyncScope::Project => Self::project(project_id),
            SyncScope::User => Self {
                project_id: project_id.to_string(),
                user_id: user_id.map(str::to_string),
            },
        }
    }
}

/// A reservable resource together with the function that resyncs it.
#[derive(Clone)]
pub struct SyncTarget {
    pub resource: String,
    pub sync: Arc<dyn UsageSync>,
}

impl SyncTarget {
    pub fn new(resource: impl Into<String>, sync: Arc<dyn UsageSync>) -> Self {
        Self {
            resource: resource.into(),
            sync,
        }
    }

    pub fn scope(&self) -> SyncScope {
        self.sync.scope()
    }
}

impl fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTarget")
            .field("resource", &self.resource)
            .field("scope", &self.scope())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ReserveItem {
    pub target: SyncTarget,
    pub delta: i64,
    pub project_limit: i64,
    pub user_limit: i64,
}

/// ReserveRequest は 1 回の予約トランザクションの入力を表す。
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub project_id: String,
    pub user_id: Option<String>,
    pub items: Vec<ReserveItem>,
    pub expire: DateTime<Utc>,
    pub until_refresh: Option<i64>,
    pub max_age: Option<TimeDelta>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub project_id: String,
    pub user_id: Option<String>,
    pub targets: Vec<SyncTarget>,
    pub until_refresh: Option<i64>,
    pub now: DateTime<Utc>,
}

/// QuotaStore は上書き設定・使用量・予約を永続化するストレージを表す。
///
/// `reserve`, `refresh_usage`, `commit`, `rollback` and `expire` each run as a
/// single transaction that serializes against other mutations of the same
/// project and leaves no partial effect on failure.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_project_quota(
        &self,
        project_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError>;

    async fn get_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError>;

    async fn get_class_quota(
        &self,
        class_name: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError>;

    async fn get_all_by_project(&self, project_id: &str) -> Result<QuotaMap, QuotaError>;

    async fn get_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<QuotaMap, QuotaError>;

    async fn get_all_by_class(&self, class_name: &str) -> Result<QuotaMap, QuotaError>;

    /// Every per-user override inside the project.
    async fn get_all_user_quotas(&self, project_id: &str) -> Result<Vec<UserQuota>, QuotaError>;

    async fn set_project_quota(
        &self,
        project_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError>;

    async fn set_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError>;

    async fn set_class_quota(
        &self,
        class_name: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError>;

    async fn get_usage(
        &self,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<Option<QuotaUsage>, QuotaError>;

    /// Every usage row of the project, all users included.
    async fn get_usages_by_project(&self, project_id: &str) -> Result<Vec<QuotaUsage>, QuotaError>;

    /// The user's rows plus the project-scoped rows.
    async fn get_usages_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Vec<QuotaUsage>, QuotaError>;

    /// Sets `in_use` to -1. Returns false when no row exists.
    async fn reset_usage(
        &self,
        admin: &AdminCapability,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<bool, QuotaError>;

    async fn reserve(
        &self,
        ctx: &QuotaContext,
        request: ReserveRequest,
    ) -> Result<Vec<Reservation>, QuotaError>;

    /// Returns the number of reservations resolved.
    async fn commit(&self, reservations: &[Reservation]) -> Result<usize, QuotaError>;

    async fn rollback(&self, reservations: &[Reservation]) -> Result<usize, QuotaError>;

    async fn refresh_usage(
        &self,
        ctx: &QuotaContext,
        request: RefreshRequest,
    ) -> Result<(), QuotaError>;

    /// Rolls back every reservation that expired before `now`.
    async fn expire(&self, now: DateTime<Utc>) -> Result<usize, QuotaError>;

    async fn destroy_all_by_project(&self, project_id: &str) -> Result<(), QuotaError>;

    async fn destroy_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError>;
}
