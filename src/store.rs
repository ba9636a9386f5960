//! Desired State Reader
//!
//! Read-only access to the intent store's per-scope snapshots.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::model::DesiredState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("intent store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed snapshot for scope {scope}: {reason}")]
    Malformed { scope: String, reason: String },
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Fully materialized desired state of `scope`
    async fn fetch(&self, scope: &str) -> Result<DesiredState, StoreError>;
}

/// Directory of `<scope>.json` exports
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{}.json", scope))
    }
}

#[async_trait]
impl IntentStore for JsonFileStore {
    async fn fetch(&self, scope: &str) -> Result<DesiredState, StoreError> {
        let path = self.path(scope);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;

        let mut state: DesiredState =
            serde_json::from_str(&content).map_err(|e| StoreError::Malformed {
                scope: scope.to_string(),
                reason: e.to_string(),
            })?;
        state.scope = scope.to_string();
        Ok(state)
    }
}

/// In-process snapshots
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, DesiredState>>,
    available: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            available: RwLock::new(true),
        }
    }

    pub fn put(&self, state: DesiredState) {
        self.snapshots.write().insert(state.scope.clone(), state);
    }

    /// Mutate a scope's snapshot in place
    pub fn update(&self, scope: &str, f: impl FnOnce(&mut DesiredState)) {
        let mut snapshots = self.snapshots.write();
        let state = snapshots
            .entry(scope.to_string())
            .or_insert_with(|| DesiredState::new(scope));
        f(state);
    }

    pub fn set_available(&self, available: bool) {
        *self.available.write() = available;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn fetch(&self, scope: &str) -> Result<DesiredState, StoreError> {
        if !*self.available.read() {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(self
            .snapshots
            .read()
            .get(scope)
            .cloned()
            .unwrap_or_else(|| DesiredState::new(scope)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = std::env::temp_dir().join(format!("intent-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let json = r#"{
            "domains": [{"id": "d1", "cidr": "10.1.0.0/16", "segment_id": 100}],
            "gateways": [{"id": "g1", "domain_id": "d1", "kind": "internet"}]
        }"#;
        tokio::fs::write(dir.join("blue.json"), json).await.unwrap();

        let store = JsonFileStore::new(&dir);
        let state = store.fetch("blue").await.unwrap();
        assert_eq!(state.scope, "blue");
        assert_eq!(state.domains.len(), 1);
        assert_eq!(state.gateways[0].kind.name(), "internet");

        assert!(matches!(store.fetch("green").await, Err(StoreError::Unavailable(_))));

        tokio::fs::write(dir.join("red.json"), "{not json").await.unwrap();
        assert!(matches!(store.fetch("red").await, Err(StoreError::Malformed { .. })));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_memory_store_toggle() {
        let store = MemoryStore::new();
        store.update("blue", |s| s.hubs.clear());
        tokio_test::assert_ok!(tokio_test::block_on(store.fetch("blue")));

        store.set_available(false);
        assert!(matches!(
            tokio_test::block_on(store.fetch("blue")),
            Err(StoreError::Unavailable(_))
        ));
    }
}
