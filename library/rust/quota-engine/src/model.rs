use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 無制限を表す上限値。
pub const UNLIMITED: i64 = -1;

/// HTTP 413 相当の超過ステータスコード。
pub const OVER_QUOTA_CODE: u16 = 413;

/// Resource name → integer value, ordered by name.
pub type QuotaMap = BTreeMap<String, i64>;

/// QuotaUsage は (project[, user], resource) 単位の使用量レコードを表す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub id: Uuid,
    pub project_id: String,
    pub user_id: Option<String>,
    pub resource: String,
    /// Negative means the next reservation must resync.
    pub in_use: i64,
    pub reserved: i64,
    pub until_refresh: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaUsage {
    pub fn new(
        project_id: impl Into<String>,
        user_id: Option<String>,
        resource: impl Into<String>,
        until_refresh: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            user_id,
            resource: resource.into(),
            in_use: 0,
            reserved: 0,
            until_refresh,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total(&self) -> i64 {
        self.in_use + self.reserved
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            in_use: self.in_use,
            reserved: self.reserved,
        }
    }
}

/// Reservation は未確定の使用量割り当てのハンドルを表す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub usage_id: Uuid,
    pub project_id: String,
    pub user_id: Option<String>,
    pub resource: String,
    pub delta: i64,
    pub expire: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire < now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub in_use: i64,
    pub reserved: i64,
}

impl UsageSnapshot {
    pub fn total(&self) -> i64 {
        self.in_use + self.reserved
    }
}

/// QuotaDetail は 1 リソース分の上限と使用状況を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDetail {
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_use: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remains: Option<i64>,
}

impl QuotaDetail {
    pub fn limit_only(limit: i64) -> Self {
        Self {
            limit,
            in_use: None,
            reserved: None,
            remains: None,
        }
    }

    /// Consumed amount, treating missing usage as zero.
    pub fn consumed(&self) -> i64 {
        self.in_use.unwrap_or(0) + self.reserved.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettableQuota {
    pub minimum: i64,
    pub maximum: i64,
}

/// ユーザー単位の上書き値。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    pub resource: String,
    pub hard_limit: i64,
}

/// QuotaQuery は上限読み出し系の表示オプションを表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaQuery {
    pub quota_class: Option<String>,
    pub defaults: bool,
    pub usages: bool,
    pub remains: bool,
}

impl Default for QuotaQuery {
    fn default() -> Self {
        Self {
            quota_class: None,
            defaults: true,
            usages: true,
            remains: false,
        }
    }
}

impl QuotaQuery {
    pub fn limits_only() -> Self {
        Self {
            usages: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_remains(mut self) -> Self {
        self.remains = true;
        self
    }

    #[must_use]
    pub fn with_quota_class(mut self, quota_class: impl Into<String>) -> Self {
        self.quota_class = Some(quota_class.into());
        self
    }
}

/// Explicit scope for a single limit lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitLookup {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub quota_class: Option<String>,
}

/// OverQuotaDetail は上限超過時に返される構造化ペイロード。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverQuotaDetail {
    pub code: u16,
    pub overs: Vec<String>,
    pub quotas: QuotaMap,
    pub usages: BTreeMap<String, UsageSnapshot>,
    /// Room left before the tightest applicable limit, per offending resource.
    pub headroom: QuotaMap,
}

impl OverQuotaDetail {
    pub fn new(
        mut overs: Vec<String>,
        quotas: QuotaMap,
        usages: BTreeMap<String, UsageSnapshot>,
        headroom: QuotaMap,
    ) -> Self {
        overs.sort();
        overs.dedup();
        Self {
            code: OVER_QUOTA_CODE,
            overs,
            quotas,
            usages,
            headroom,
        }
    }
}

/// Whether `value` exceeds `limit`, with [`UNLIMITED`] (or any negative limit) never exceeded.
pub fn exceeds(limit: i64, value: i64) -> bool {
    limit >= 0 && value > limit
}
