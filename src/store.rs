//! In-memory stub repository.

use crate::config::Stub;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stub not found: {0}")]
    NotFound(String),
    #[error("invalid stub: {0}")]
    Invalid(String),
}

/// Stubs in declaration order. Stubs are immutable once stored; updates
/// replace the whole entry.
#[derive(Debug, Default)]
pub struct InMemoryStubStore {
    stubs: RwLock<Vec<Arc<Stub>>>,
}

impl InMemoryStubStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding already validated stubs.
    pub fn with_stubs(stubs: impl IntoIterator<Item = Stub>) -> Self {
        Self {
            stubs: RwLock::new(stubs.into_iter().map(Arc::new).collect()),
        }
    }

    /// Insert a stub or replace the one with the same id, keeping its
    /// position. A stub without an id gets a fresh one.
    pub async fn upsert(&self, mut stub: Stub) -> Result<Arc<Stub>, StoreError> {
        if stub.id.is_empty() {
            stub.id = uuid::Uuid::new_v4().to_string();
        }
        stub.validate()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let stub = Arc::new(stub);
        let mut stubs = self.stubs.write().await;
        match stubs.iter_mut().find(|s| s.id == stub.id) {
            Some(existing) => {
                debug!(stub_id = %stub.id, "Replacing stub");
                *existing = stub.clone();
            }
            None => {
                debug!(stub_id = %stub.id, "Adding stub");
                stubs.push(stub.clone());
            }
        }
        Ok(stub)
    }

    pub async fn delete(&self, id: &str) -> Result<Arc<Stub>, StoreError> {
        let mut stubs = self.stubs.write().await;
        let index = stubs
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(stubs.remove(index))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Stub>> {
        self.stubs.read().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Stub>> {
        self.stubs.read().await.clone()
    }

    /// Enabled stubs for one route, in declaration order.
    pub async fn for_route(&self, service: &str, method: &str) -> Vec<Arc<Stub>> {
        self.stubs
            .read()
            .await
            .iter()
            .filter(|s| s.enabled && s.service == service && s.method == method)
            .cloned()
            .collect()
    }

    /// Enabled stubs of one service, in declaration order.
    pub async fn for_service(&self, service: &str) -> Vec<Arc<Stub>> {
        self.stubs
            .read()
            .await
            .iter()
            .filter(|s| s.enabled && s.service == service)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.stubs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stubs.read().await.is_empty()
    }
}
