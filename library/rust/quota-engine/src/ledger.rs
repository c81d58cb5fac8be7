use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::context::QuotaContext;
use crate::error::QuotaError;
use crate::model::{exceeds, OverQuotaDetail, QuotaMap, QuotaUsage, Reservation, UsageSnapshot};
use crate::resource::SyncScope;
use crate::store::{RefreshRequest, ReserveItem, ReserveRequest, SyncTarget, UsageScope};

#[derive(Clone)]
struct PendingSync {
    target: SyncTarget,
    row: usize,
}

/// UsageLedger は 1 プロジェクト分の使用量行をトランザクション内で操作する。
///
/// Stores load every usage row of the project under their per-project lock,
/// run one operation here, and persist `touched_rows` only when it succeeds.
/// A failed operation leaves the ledger in an undefined state; callers drop it.
pub(crate) struct UsageLedger {
    project_id: String,
    rows: Vec<QuotaUsage>,
    touched: BTreeSet<Uuid>,
}

impl UsageLedger {
    pub(crate) fn new(project_id: impl Into<String>, rows: Vec<QuotaUsage>) -> Self {
        Self {
            project_id: project_id.into(),
            rows,
            touched: BTreeSet::new(),
        }
    }

    pub(crate) fn into_rows(self) -> Vec<QuotaUsage> {
        self.rows
    }

    #[cfg(any(test, feature = "postgres"))]
    pub(crate) fn touched_rows(&self) -> impl Iterator<Item = &QuotaUsage> {
        self.rows.iter().filter(|r| self.touched.contains(&r.id))
    }

    fn position(&self, user_id: Option<&str>, resource: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.resource == resource && r.user_id.as_deref() == user_id)
    }

    fn ensure_row(
        &mut self,
        scope: &UsageScope,
        resource: &str,
        until_refresh: Option<i64>,
        now: DateTime<Utc>,
    ) -> (usize, bool) {
        if let Some(idx) = self.position(scope.user_id.as_deref(), resource) {
            return (idx, false);
        }
        let row = QuotaUsage::new(
            self.project_id.clone(),
            scope.user_id.clone(),
            resource,
            until_refresh,
            now,
        );
        self.touched.insert(row.id);
        self.rows.push(row);
        (self.rows.len() - 1, true)
    }

    /// Sum over every row of the project for the resource.
    fn project_usage(&self, resource: &str) -> UsageSnapshot {
        self.rows
            .iter()
            .filter(|r| r.resource == resource)
            .fold(UsageSnapshot::default(), |acc, r| UsageSnapshot {
                in_use: acc.in_use + r.in_use,
                reserved: acc.reserved + r.reserved,
            })
    }

    /// Decides whether the row must be resynced, counting down `until_refresh`.
    fn needs_refresh(&mut self, idx: usize, max_age: Option<TimeDelta>, now: DateTime<Utc>) -> bool {
        let row = &mut self.rows[idx];
        if row.in_use < 0 {
            return true;
        }
        if let Some(remaining) = row.until_refresh {
            let remaining = remaining - 1;
            row.until_refresh = Some(remaining);
            self.touched.insert(row.id);
            if remaining <= 0 {
                return true;
            }
        }
        max_age.is_some_and(|max_age| now - row.updated_at >= max_age)
    }

    async fn resync(
        &mut self,
        ctx: &QuotaContext,
        user_id: Option<&str>,
        mut pending: Vec<PendingSync>,
        until_refresh: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        while !pending.is_empty() {
            let current = pending.remove(0);
            let scope = current.target.scope();
            let sync_user = match scope {
                SyncScope::Project => None,
                SyncScope::User => user_id,
            };
            let updates = current
                .target
                .sync
                .sync(ctx, &self.project_id, sync_user)
                .await
                .map_err(|e| QuotaError::sync_failed(&current.target.resource, &e))?;
            if !updates.contains_key(&current.target.resource) {
                tracing::warn!(
                    project_id = %self.project_id,
                    resource = %current.target.resource,
                    "sync function did not report the resource it was called for"
                );
            }

            let (refreshed, rest): (Vec<PendingSync>, Vec<PendingSync>) =
                pending.into_iter().partition(|p| {
                    p.target.scope() == scope && updates.contains_key(&p.target.resource)
                });
            pending = rest;

            for item in std::iter::once(current).chain(refreshed) {
                if let Some(&in_use) = updates.get(&item.target.resource) {
                    let row = &mut self.rows[item.row];
                    row.in_use = in_use;
                    row.until_refresh = until_refresh;
                    row.updated_at = now;
                    self.touched.insert(row.id);
                }
            }
        }
        Ok(())
    }

    /// Reconciles stale rows, checks every delta against its limits and
    /// applies all of them, or none when any resource would go over.
    pub(crate) async fn reserve(
        &mut self,
        ctx: &QuotaContext,
        request: &ReserveRequest,
    ) -> Result<Vec<Reservation>, QuotaError> {
        let user_id = request.user_id.as_deref();
        let mut rows = Vec::with_capacity(request.items.len());
        let mut pending = Vec::new();
        for item in &request.items {
            let scope = UsageScope::for_sync(&self.project_id, user_id, item.target.scope());
            let (idx, created) = self.ensure_row(
                &scope,
                &item.target.resource,
                request.until_refresh,
                request.now,
            );
            rows.push(idx);
            if created || self.needs_refresh(idx, request.max_age, request.now) {
                pending.push(PendingSync {
                    target: item.target.clone(),
                    row: idx,
                });
            }
        }
        self.resync(ctx, user_id, pending, request.until_refresh, request.now)
            .await?;

        let mut unders = Vec::new();
        let mut overs = Vec::new();
        let mut project_overs = BTreeSet::new();
        for (item, &idx) in request.items.iter().zip(&rows) {
            let row = &self.rows[idx];
            if item.delta < 0 {
                if row.in_use + item.delta < 0 {
                    unders.push(item.target.resource.clone());
                }
                continue;
            }
            let project = self.project_usage(&item.target.resource);
            let over_project = exceeds(item.project_limit, project.total() + item.delta);
            let over_user = self.user_level(request, item)
                && exceeds(item.user_limit, row.total() + item.delta);
            if over_project {
                project_overs.insert(item.target.resource.clone());
            }
            if over_project || over_user {
                overs.push(item.target.resource.clone());
            }
        }
        if !unders.is_empty() {
            tracing::warn!(
                project_id = %self.project_id,
                resources = ?unders,
                "change will make usage less than 0"
            );
        }
        if !overs.is_empty() {
            return Err(self.over_quota(request, &rows, overs, &project_overs));
        }

        let mut reservations = Vec::with_capacity(request.items.len());
        for (item, &idx) in request.items.iter().zip(&rows) {
            let row = &mut self.rows[idx];
            row.reserved += item.delta;
            self.touched.insert(row.id);
            reservations.push(Reservation {
                id: Uuid::new_v4(),
                usage_id: row.id,
                project_id: self.project_id.clone(),
                user_id: request.user_id.clone(),
                resource: item.target.resource.clone(),
                delta: item.delta,
                expire: request.expire,
                created_at: request.now,
            });
        }
        Ok(reservations)
    }

    fn user_level(&self, request: &ReserveRequest, item: &ReserveItem) -> bool {
        request.user_id.is_some() && item.target.scope() == SyncScope::User
    }

    /// Offenders report the level that overflowed, the project level winning
    /// when both did.
    fn over_quota(
        &self,
        request: &ReserveRequest,
        rows: &[usize],
        overs: Vec<String>,
        project_overs: &BTreeSet<String>,
    ) -> QuotaError {
        let mut quotas = QuotaMap::new();
        let mut usages = BTreeMap::new();
        let mut headroom = QuotaMap::new();
        for (item, &idx) in request.items.iter().zip(rows) {
            let resource = &item.target.resource;
            let project = self.project_usage(resource);
            let user_level = self.user_level(request, item);
            let (limit, usage) = if user_level && !project_overs.contains(resource) {
                (item.user_limit, self.rows[idx].snapshot())
            } else {
                (item.project_limit, project)
            };
            quotas.insert(resource.clone(), limit);
            if !overs.contains(resource) {
                continue;
            }
            usages.insert(resource.clone(), usage);

            let mut room = Vec::new();
            if item.project_limit >= 0 {
                room.push(item.project_limit - project.total());
            }
            if user_level && item.user_limit >= 0 {
                room.push(item.user_limit - self.rows[idx].total());
            }
            if let Some(min) = room.into_iter().min() {
                headroom.insert(resource.clone(), min);
            }
        }
        tracing::warn!(
            project_id = %self.project_id,
            user_id = ?request.user_id,
            overs = ?overs,
            "quota exceeded"
        );
        QuotaError::OverQuota(Box::new(OverQuotaDetail::new(overs, quotas, usages, headroom)))
    }

    /// Recomputes `in_use` from the sync functions without touching `reserved`.
    pub(crate) async fn refresh(
        &mut self,
        ctx: &QuotaContext,
        request: &RefreshRequest,
    ) -> Result<(), QuotaError> {
        let user_id = request.user_id.as_deref();
        let mut pending = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            let scope = UsageScope::for_sync(&self.project_id, user_id, target.scope());
            let (idx, _) = self.ensure_row(&scope, &target.resource, request.until_refresh, request.now);
            pending.push(PendingSync {
                target: target.clone(),
                row: idx,
            });
        }
        self.resync(ctx, user_id, pending, request.until_refresh, request.now)
            .await
    }

    /// Moves the reservation's delta from `reserved` into `in_use`.
    pub(crate) fn commit(&mut self, reservation: &Reservation) -> bool {
        self.settle(reservation, true)
    }

    pub(crate) fn rollback(&mut self, reservation: &Reservation) -> bool {
        self.settle(reservation, false)
    }

    fn settle(&mut self, reservation: &Reservation, commit: bool) -> bool {
        let Some(row) = self.rows.iter_mut().find(|r| r.id == reservation.usage_id) else {
            return false;
        };
        if commit {
            row.in_use += reservation.delta;
        }
        row.reserved -= reservation.delta;
        self.touched.insert(row.id);
        true
    }
}
