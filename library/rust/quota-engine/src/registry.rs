use std::collections::{BTreeSet, HashMap};

use crate::error::QuotaError;
use crate::resource::{Resource, ResourceKind, SyncScope};

/// Engine operations that only accept certain resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaMethod {
    Check,
    Reserve,
    Commit,
    Rollback,
}

impl QuotaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMethod::Check => "check",
            QuotaMethod::Reserve => "reserve",
            QuotaMethod::Commit => "commit",
            QuotaMethod::Rollback => "rollback",
        }
    }

    /// メソッドとリソース種別の対応表。
    pub fn accepts(&self, kind: ResourceKind) -> bool {
        match self {
            QuotaMethod::Check => {
                matches!(kind, ResourceKind::Countable | ResourceKind::Reservable)
            }
            QuotaMethod::Reserve | QuotaMethod::Commit | QuotaMethod::Rollback => {
                kind == ResourceKind::Reservable
            }
        }
    }
}

/// ResourceRegistry はリソース名からリソース定義への対応を保持する。
///
/// Iteration follows registration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: Resource) -> Result<(), QuotaError> {
        if self.index.contains_key(resource.name()) {
            return Err(QuotaError::DuplicateResource(resource.name().to_string()));
        }
        self.index
            .insert(resource.name().to_string(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Registers every resource or none of them.
    pub fn register_many(
        &mut self,
        resources: impl IntoIterator<Item = Resource>,
    ) -> Result<(), QuotaError> {
        let resources: Vec<Resource> = resources.into_iter().collect();
        let mut seen = BTreeSet::new();
        for resource in &resources {
            if self.index.contains_key(resource.name()) || !seen.insert(resource.name()) {
                return Err(QuotaError::DuplicateResource(resource.name().to_string()));
            }
        }
        for resource in resources {
            self.register(resource)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.index.get(name).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(Resource::name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Rejects every name that is unknown or of a kind `method` does not accept,
    /// reporting all offenders in one error.
    pub fn validate<'a>(
        &self,
        method: QuotaMethod,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), QuotaError> {
        let offenders: BTreeSet<&str> = names
            .into_iter()
            .filter(|name| {
                self.get(name)
                    .is_none_or(|resource| !method.accepts(resource.kind()))
            })
            .collect();
        if offenders.is_empty() {
            return Ok(());
        }
        Err(QuotaError::InvalidMethodUsage {
            method: method.as_str().to_string(),
            resources: offenders.into_iter().map(str::to_string).collect(),
        })
    }

    /// Fails with `ResourceUnknown` listing every unregistered name.
    pub fn require_known<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), QuotaError> {
        let unknown: BTreeSet<&str> = names.into_iter().filter(|n| !self.contains(n)).collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(QuotaError::ResourceUnknown {
            resources: unknown.into_iter().map(str::to_string).collect(),
        })
    }

    /// Reservable resources whose sync function reports at `scope`.
    pub fn refreshable(&self, scope: SyncScope) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.sync_scope() == Some(scope))
            .map(Resource::name)
            .collect()
    }

    /// Resolves the resources a usage refresh should cover.
    ///
    /// With no names, every resource refreshable at the scope is returned.
    /// Otherwise each name must be refreshable at the scope; the first one
    /// that is not fails the whole request.
    pub fn refresh_targets(
        &self,
        project_id: &str,
        user_id: Option<&str>,
        names: Option<&[String]>,
    ) -> Result<Vec<String>, QuotaError> {
        let scope = if user_id.is_some() {
            SyncScope::User
        } else {
            SyncScope::Project
        };
        let syncable = self.refreshable(scope);
        let Some(names) = names else {
            return Ok(syncable.into_iter().map(str::to_string).collect());
        };
        for name in names {
            if !syncable.contains(&name.as_str()) {
                return Err(QuotaError::UsageRefreshNotAllowed {
                    resource: name.clone(),
                    project_id: project_id.to_string(),
                    user_id: user_id.map(str::to_string),
                    syncable: syncable.iter().map(|s| (*s).to_string()).collect(),
                });
            }
        }
        Ok(names.to_vec())
    }
}
