use thiserror::Error;

use crate::model::OverQuotaDetail;

/// QuotaError はクォータエンジン全体のエラーを表す。
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("unknown quota resources: {}", .resources.join(", "))]
    ResourceUnknown { resources: Vec<String> },

    #[error("resources are not valid for {method}: {}", .resources.join(", "))]
    InvalidMethodUsage {
        method: String,
        resources: Vec<String>,
    },

    #[error("change would make usage less than 0 for: {}", .unders.join(", "))]
    InvalidQuotaValue { unders: Vec<String> },

    #[error("invalid reservation expiration: {expire}")]
    InvalidReservationExpiration { expire: String },

    #[error("quota exceeded for resources: {}", .0.overs.join(", "))]
    OverQuota(Box<OverQuotaDetail>),

    #[error("quota for project {project_id} could not be found")]
    ProjectQuotaNotFound { project_id: String },

    #[error("quota for user {user_id} in project {project_id} could not be found")]
    ProjectUserQuotaNotFound { project_id: String, user_id: String },

    #[error("quota class {class_name} could not be found")]
    QuotaClassNotFound { class_name: String },

    #[error("quota usage for project {project_id} could not be found")]
    QuotaUsageNotFound { project_id: String },

    #[error(
        "usage refresh of {resource} is not allowed for project {project_id} (user {user_id:?}); refreshable: {}",
        .syncable.join(", ")
    )]
    UsageRefreshNotAllowed {
        resource: String,
        project_id: String,
        user_id: Option<String>,
        syncable: Vec<String>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource already registered: {0}")]
    DuplicateResource(String),

    #[error("unknown quota driver: {0}")]
    UnknownDriver(String),

    #[error("usage function for {resource} failed: {message}")]
    SyncFailed { resource: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl QuotaError {
    /// 上書き設定の未登録を示すエラーであれば true を返す。
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectQuotaNotFound { .. }
                | Self::ProjectUserQuotaNotFound { .. }
                | Self::QuotaClassNotFound { .. }
                | Self::QuotaUsageNotFound { .. }
        )
    }

    pub(crate) fn sync_failed(resource: &str, err: &anyhow::Error) -> Self {
        Self::SyncFailed {
            resource: resource.to_string(),
            message: format!("{err:#}"),
        }
    }
}
