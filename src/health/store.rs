//! Persistence of health verdicts, keyed by service name.

use super::ServiceHealth;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn load(&self, service: &str) -> Result<Option<ServiceHealth>>;
    async fn save(&self, health: &ServiceHealth) -> Result<()>;
    async fn remove(&self, service: &str) -> Result<bool>;
    async fn all(&self) -> Result<Vec<ServiceHealth>>;
    fn name(&self) -> &'static str;
}

/// Process-local health table.
#[derive(Default)]
pub struct MemoryHealthStore {
    entries: RwLock<HashMap<String, ServiceHealth>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn load(&self, service: &str) -> Result<Option<ServiceHealth>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(service).cloned())
    }
    async fn save(&self, health: &ServiceHealth) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(health.service_name.clone(), health.clone());
        Ok(())
    }
    async fn remove(&self, service: &str) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        Ok(entries.remove(service).is_some())
    }
    async fn all(&self) -> Result<Vec<ServiceHealth>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ServiceHealth> = entries.values().cloned().collect();
        out.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(out)
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}
