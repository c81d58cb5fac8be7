use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::context::{AdminCapability, QuotaContext};
use crate::error::QuotaError;
use crate::ledger::UsageLedger;
use crate::model::{QuotaMap, QuotaUsage, Reservation, UserQuota};
use crate::store::{QuotaStore, RefreshRequest, ReserveRequest, UsageScope};

#[derive(Debug, Default)]
struct Overrides {
    projects: HashMap<(String, String), i64>,
    users: HashMap<(String, String, String), i64>,
    classes: HashMap<(String, String), i64>,
}

#[derive(Debug, Default)]
struct ProjectUsage {
    usages: Vec<QuotaUsage>,
    reservations: HashMap<Uuid, Reservation>,
}

/// InMemoryQuotaStore はメモリ上でクォータを管理するストア。
///
/// Usage rows are locked per project, so reservations for different
/// projects never wait on each other.
#[derive(Clone, Default)]
pub struct InMemoryQuotaStore {
    overrides: Arc<RwLock<Overrides>>,
    projects: Arc<RwLock<HashMap<String, Arc<Mutex<ProjectUsage>>>>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn project(&self, project_id: &str) -> Arc<Mutex<ProjectUsage>> {
        if let Some(project) = self.projects.read().await.get(project_id) {
            return project.clone();
        }
        self.projects
            .write()
            .await
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_project(&self, project_id: &str) -> Option<Arc<Mutex<ProjectUsage>>> {
        self.projects.read().await.get(project_id).cloned()
    }

    async fn settle(&self, reservations: &[Reservation], commit: bool) -> usize {
        let mut by_project: BTreeMap<&str, Vec<&Reservation>> = BTreeMap::new();
        for reservation in reservations {
            by_project
                .entry(reservation.project_id.as_str())
                .or_default()
                .push(reservation);
        }

        let mut settled = 0;
        for (project_id, handles) in by_project {
            let Some(project) = self.existing_project(project_id).await else {
                tracing::warn!(project_id, "no usage recorded for reservations");
                continue;
            };
            let mut state = project.lock().await;
            let mut ledger = UsageLedger::new(project_id, std::mem::take(&mut state.usages));
            for handle in handles {
                match state.reservations.remove(&handle.id) {
                    Some(stored) => {
                        let applied = if commit {
                            ledger.commit(&stored)
                        } else {
                            ledger.rollback(&stored)
                        };
                        if applied {
                            settled += 1;
                        }
                    }
                    None => {
                        tracing::warn!(
                            project_id,
                            reservation_id = %handle.id,
                            "reservation already resolved"
                        );
                    }
                }
            }
            state.usages = ledger.into_rows();
        }
        settled
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_project_quota(
        &self,
        project_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .projects
            .get(&(project_id.to_string(), resource.to_string()))
            .copied())
    }

    async fn get_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .users
            .get(&(
                project_id.to_string(),
                user_id.to_string(),
                resource.to_string(),
            ))
            .copied())
    }

    async fn get_class_quota(
        &self,
        class_name: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .classes
            .get(&(class_name.to_string(), resource.to_string()))
            .copied())
    }

    async fn get_all_by_project(&self, project_id: &str) -> Result<QuotaMap, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .projects
            .iter()
            .filter(|((p, _), _)| p == project_id)
            .map(|((_, r), limit)| (r.clone(), *limit))
            .collect())
    }

    async fn get_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<QuotaMap, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .users
            .iter()
            .filter(|((p, u, _), _)| p == project_id && u == user_id)
            .map(|((_, _, r), limit)| (r.clone(), *limit))
            .collect())
    }

    async fn get_all_by_class(&self, class_name: &str) -> Result<QuotaMap, QuotaError> {
        let overrides = self.overrides.read().await;
        Ok(overrides
            .classes
            .iter()
            .filter(|((c, _), _)| c == class_name)
            .map(|((_, r), limit)| (r.clone(), *limit))
            .collect())
    }

    async fn get_all_user_quotas(&self, project_id: &str) -> Result<Vec<UserQuota>, QuotaError> {
        let overrides = self.overrides.read().await;
        let mut quotas: Vec<UserQuota> = overrides
            .users
            .iter()
            .filter(|((p, _, _), _)| p == project_id)
            .map(|((_, u, r), limit)| UserQuota {
                user_id: u.clone(),
                resource: r.clone(),
                hard_limit: *limit,
            })
            .collect();
        quotas.sort_by(|a, b| (&a.user_id, &a.resource).cmp(&(&b.user_id, &b.resource)));
        Ok(quotas)
    }

    async fn set_project_quota(
        &self,
        project_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        let mut overrides = self.overrides.write().await;
        overrides
            .projects
            .insert((project_id.to_string(), resource.to_string()), limit);
        Ok(())
    }

    async fn set_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        let mut overrides = self.overrides.write().await;
        overrides.users.insert(
            (
                project_id.to_string(),
                user_id.to_string(),
                resource.to_string(),
            ),
            limit,
        );
        Ok(())
    }

    async fn set_class_quota(
        &self,
        class_name: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        let mut overrides = self.overrides.write().await;
        overrides
            .classes
            .insert((class_name.to_string(), resource.to_string()), limit);
        Ok(())
    }

    async fn get_usage(
        &self,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<Option<QuotaUsage>, QuotaError> {
        let Some(project) = self.existing_project(&scope.project_id).await else {
            return Ok(None);
        };
        let state = project.lock().await;
        Ok(state
            .usages
            .iter()
            .find(|u| u.resource == resource && u.user_id == scope.user_id)
            .cloned())
    }

    async fn get_usages_by_project(&self, project_id: &str) -> Result<Vec<QuotaUsage>, QuotaError> {
        let Some(project) = self.existing_project(project_id).await else {
            return Ok(Vec::new());
        };
        let state = project.lock().await;
        Ok(state.usages.clone())
    }

    async fn get_usages_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Vec<QuotaUsage>, QuotaError> {
        let Some(project) = self.existing_project(project_id).await else {
            return Ok(Vec::new());
        };
        let state = project.lock().await;
        Ok(state
            .usages
            .iter()
            .filter(|u| u.user_id.as_deref().is_none_or(|u| u == user_id))
            .cloned()
            .collect())
    }

    async fn reset_usage(
        &self,
        _admin: &AdminCapability,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<bool, QuotaError> {
        let Some(project) = self.existing_project(&scope.project_id).await else {
            return Ok(false);
        };
        let mut state = project.lock().await;
        match state
            .usages
            .iter_mut()
            .find(|u| u.resource == resource && u.user_id == scope.user_id)
        {
            Some(usage) => {
                usage.in_use = -1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reserve(
        &self,
        ctx: &QuotaContext,
        request: ReserveRequest,
    ) -> Result<Vec<Reservation>, QuotaError> {
        let project = self.project(&request.project_id).await;
        let mut state = project.lock().await;
        let mut ledger = UsageLedger::new(request.project_id.clone(), state.usages.clone());
        let reservations = ledger.reserve(ctx, &request).await?;
        state.usages = ledger.into_rows();
        for reservation in &reservations {
            state
                .reservations
                .insert(reservation.id, reservation.clone());
        }
        Ok(reservations)
    }

    async fn commit(&self, reservations: &[Reservation]) -> Result<usize, QuotaError> {
        Ok(self.settle(reservations, true).await)
    }

    async fn rollback(&self, reservations: &[Reservation]) -> Result<usize, QuotaError> {
        Ok(self.settle(reservations, false).await)
    }

    async fn refresh_usage(
        &self,
        ctx: &QuotaContext,
        request: RefreshRequest,
    ) -> Result<(), QuotaError> {
        let project = self.project(&request.project_id).await;
        let mut state = project.lock().await;
        let mut ledger = UsageLedger::new(request.project_id.clone(), state.usages.clone());
        ledger.refresh(ctx, &request).await?;
        state.usages = ledger.into_rows();
        Ok(())
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let projects: Vec<(String, Arc<Mutex<ProjectUsage>>)> = self
            .projects
            .read()
            .await
            .iter()
            .map(|(id, project)| (id.clone(), project.clone()))
            .collect();

        let mut expired = 0;
        for (project_id, project) in projects {
            let mut state = project.lock().await;
            let stale: Vec<Uuid> = state
                .reservations
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id)
                .collect();
            if stale.is_empty() {
                continue;
            }
            let mut ledger = UsageLedger::new(project_id, std::mem::take(&mut state.usages));
            for id in stale {
                if let Some(reservation) = state.reservations.remove(&id) {
                    ledger.rollback(&reservation);
                    expired += 1;
                }
            }
            state.usages = ledger.into_rows();
        }
        Ok(expired)
    }

    async fn destroy_all_by_project(&self, project_id: &str) -> Result<(), QuotaError> {
        {
            let mut overrides = self.overrides.write().await;
            overrides.projects.retain(|(p, _), _| p != project_id);
            overrides.users.retain(|(p, _, _), _| p != project_id);
        }
        self.projects.write().await.remove(project_id);
        Ok(())
    }

    async fn destroy_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError> {
        {
            let mut overrides = self.overrides.write().await;
            overrides
                .users
                .retain(|(p, u, _), _| !(p == project_id && u == user_id));
        }
        let Some(project) = self.existing_project(project_id).await else {
            return Ok(());
        };
        let mut state = project.lock().await;
        let owned: Vec<Uuid> = state
            .reservations
            .values()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .map(|r| r.id)
            .collect();
        let mut ledger = UsageLedger::new(project_id, std::mem::take(&mut state.usages));
        for id in owned {
            if let Some(reservation) = state.reservations.remove(&id) {
                ledger.rollback(&reservation);
            }
        }
        let mut usages = ledger.into_rows();
        usages.retain(|u| u.user_id.as_deref() != Some(user_id));
        state.usages = usages;
        Ok(())
    }
}
