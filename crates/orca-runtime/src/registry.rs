use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use orca_core::{Capability, CapabilityInfo, OrcaError, Params, Result};

/// Name → capability table shared by every turn.
///
/// The lock guards lookups and inserts only; it is never held across `execute`.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Capability>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the capability's own name.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.name().to_string();
        self.register_as(name, capability)
    }

    /// Register under an explicit name. Fails if the name is taken.
    pub fn register_as(&self, name: impl Into<String>, capability: Arc<dyn Capability>) -> Result<()> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(OrcaError::AlreadyRegistered(name));
        }
        info!(capability = %name, "registered capability");
        entries.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Name and description of every capability, sorted by name.
    pub fn infos(&self) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .entries
            .read()
            .iter()
            .map(|(name, cap)| CapabilityInfo {
                name: name.clone(),
                description: cap.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Invoke by name. The capability's result or error is returned as-is.
    pub async fn invoke(&self, name: &str, params: &Params) -> Result<Value> {
        let capability = self
            .get(name)
            .ok_or_else(|| OrcaError::CapabilityNotFound(name.to_string()))?;
        debug!(capability = %name, params = params.len(), "invoking capability");
        capability.execute(params).await
    }
}
