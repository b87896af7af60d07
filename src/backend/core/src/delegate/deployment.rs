//! Deployment units that delegate code runs inside.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::{ConductorError, Result};

/// Reference to a deployment unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeploymentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeploymentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&DeploymentId> for DeploymentId {
    fn from(id: &DeploymentId) -> Self {
        id.clone()
    }
}

/// The isolated context of one deployment, as seen by code running inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: DeploymentId,
    pub name: String,
    /// Resources visible only to this deployment
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DeploymentHandle {
    pub fn new(id: impl Into<DeploymentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Known deployments.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    deployments: DashMap<DeploymentId, Arc<DeploymentHandle>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deployment, replacing one with the same id.
    pub fn register(&self, handle: DeploymentHandle) -> Arc<DeploymentHandle> {
        let handle = Arc::new(handle);
        info!(deployment = %handle.id, name = %handle.name, "Deployment registered");
        self.deployments.insert(handle.id.clone(), handle.clone());
        handle
    }

    pub fn unregister(&self, id: &DeploymentId) -> Option<Arc<DeploymentHandle>> {
        self.deployments.remove(id).map(|(_, h)| h)
    }

    /// The context handle of `id`.
    pub fn resolve(&self, id: &DeploymentId) -> Result<Arc<DeploymentHandle>> {
        self.deployments
            .get(id)
            .map(|h| h.value().clone())
            .ok_or_else(|| ConductorError::deployment_not_found(id))
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_resolve() {
        let registry = DeploymentRegistry::new();
        registry.register(DeploymentHandle::new("billing", "Billing").with_property("tenant", "acme"));

        let handle = registry.resolve(&DeploymentId::from("billing")).unwrap();
        assert_eq!(handle.property("tenant"), Some("acme"));

        let err = registry.resolve(&DeploymentId::from("shipping")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeploymentNotFound);
    }
}
