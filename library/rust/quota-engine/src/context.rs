/// QuotaContext は呼び出し元のテナント情報を表す。
///
/// Every engine call receives one. Explicit `project_id`/`user_id` arguments
/// on individual calls take precedence over the values carried here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaContext {
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub quota_class: Option<String>,
}

impl QuotaContext {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            user_id: Some(user_id.into()),
            quota_class: None,
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_quota_class(mut self, quota_class: impl Into<String>) -> Self {
        self.quota_class = Some(quota_class.into());
        self
    }

    /// Whether `project_id` names the caller's own project.
    pub fn owns_project(&self, project_id: &str) -> bool {
        self.project_id.as_deref() == Some(project_id)
    }
}

/// AdminCapability は管理者権限が必要な操作への許可を表す。
///
/// Only the crate can mint one; store operations that bypass the caller's
/// own privilege (usage reset) require it as an argument.
#[derive(Debug)]
pub struct AdminCapability {
    _private: (),
}

impl AdminCapability {
    pub(crate) fn grant() -> Self {
        Self { _private: () }
    }
}
