use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::policy::CapabilityPolicy;
use super::{
    Capability, CapabilityPool, FILE_READ_CAPABILITY, FILE_WRITE_CAPABILITY,
    WEB_SEARCH_CAPABILITY,
};
use crate::catalog::RoleName;
use crate::error::{CapabilityError, CrewError};

/// Fixed role → capability-name table. Roles absent from the table get none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleCapabilityMap {
    roles: BTreeMap<RoleName, Vec<String>>,
}

impl RoleCapabilityMap {
    pub fn builtin() -> Self {
        Self::default()
            .with_role("Market Researcher", [WEB_SEARCH_CAPABILITY])
            .with_role("Target Audience Analyst", [WEB_SEARCH_CAPABILITY])
            .with_role("Content Writer", [FILE_READ_CAPABILITY])
            .with_role("Campaign Manager", [FILE_WRITE_CAPABILITY])
    }

    pub fn with_role<I, S>(mut self, role: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(RoleName::from(role), capabilities);
        self
    }

    /// Replaces the entry for `role`, dropping duplicate names.
    pub fn set<I, S>(&mut self, role: RoleName, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let names = capabilities
            .into_iter()
            .map(Into::into)
            .map(|name: String| name.trim().to_string())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect();
        self.roles.insert(role, names);
    }

    pub fn apply_overrides(&mut self, overrides: &HashMap<String, Vec<String>>) {
        for (role, names) in overrides {
            self.set(RoleName::new(role.trim()), names.iter().cloned());
        }
    }

    pub fn capabilities_for(&self, role: &RoleName) -> &[String] {
        self.roles.get(role).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every capability name needed by `roles`, for one-shot instantiation.
    pub fn referenced_names<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a RoleName>,
    ) -> BTreeSet<String> {
        roles
            .into_iter()
            .flat_map(|role| self.capabilities_for(role).iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedCapability {
    pub name: String,
    pub reason: CapabilityError,
}

#[derive(Clone, Default)]
pub struct ResolvedCapabilities {
    pub capabilities: Vec<Arc<dyn Capability>>,
    pub dropped: Vec<DroppedCapability>,
}

impl ResolvedCapabilities {
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }
}

/// Pure lookup over the role table, the run's pool, and the policy.
#[derive(Clone, Copy)]
pub struct CapabilityResolver<'a> {
    map: &'a RoleCapabilityMap,
    pool: &'a CapabilityPool,
    policy: &'a CapabilityPolicy,
}

impl<'a> CapabilityResolver<'a> {
    pub fn new(
        map: &'a RoleCapabilityMap,
        pool: &'a CapabilityPool,
        policy: &'a CapabilityPolicy,
    ) -> Self {
        Self { map, pool, policy }
    }

    pub fn resolve(&self, role: &RoleName) -> Result<ResolvedCapabilities, CrewError> {
        let mut resolved = ResolvedCapabilities::default();
        for name in self.map.capabilities_for(role) {
            if !self.policy.permits(name) {
                continue;
            }
            match self.pool.get(name) {
                Ok(capability) => resolved.capabilities.push(capability),
                Err(reason) if self.policy.is_mandatory(name) => {
                    return Err(CrewError::MandatoryCapability {
                        capability: name.clone(),
                        reason: reason.to_string(),
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        role = role.as_str(),
                        capability = name.as_str(),
                        error = %reason,
                        "dropping unavailable capability"
                    );
                    resolved.dropped.push(DroppedCapability {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(resolved)
    }
}
