//! Instance storage capability.
//!
//! The engine reads and writes entity instances only through the [`Store`]
//! trait. Two in-process implementations ship with the crate:
//!
//! - [`MemoryStore`]: a map keyed by id, insertion ordered.
//! - [`JsonFileStore`]: every instance of one entity kept as a single JSON
//!   array in one file.
//!
//! Relational or hosted backends are supplied by the host through
//! [`RuntimeOptions::store_provider`](crate::options::RuntimeOptions).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::value::Value;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// EntityInstance
// ---------------------------------------------------------------------------

/// A stored record: an id plus arbitrary named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityInstance {
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl EntityInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Read a field. `id` is readable like any other field.
    pub fn get(&self, field: &str) -> Option<serde_json::Value> {
        if field == "id" {
            return Some(serde_json::Value::String(self.id.clone()));
        }
        self.fields.get(field).cloned()
    }

    /// Numeric value of a field, if it holds a number.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(serde_json::Value::as_f64)
    }

    /// Apply a partial update. An `id` key in the patch is ignored.
    pub fn merge(&mut self, patch: &serde_json::Map<String, serde_json::Value>) {
        for (k, v) in patch {
            if k != "id" {
                self.fields.insert(k.clone(), v.clone());
            }
        }
    }

    /// The instance as an evaluator object, `id` included.
    pub fn to_value(&self) -> Value {
        let mut map: std::collections::BTreeMap<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        map.insert("id".to_owned(), Value::String(self.id.clone()));
        Value::Object(map)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("EntityInstance should always be JSON-serializable")
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence capability for the instances of one entity.
#[async_trait]
pub trait Store: Send + Sync {
    /// All instances, in creation order where the backend has one.
    async fn get_all(&self) -> Result<Vec<EntityInstance>, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<EntityInstance>, StoreError>;

    /// Insert an instance, replacing any existing instance with the same id.
    async fn create(&self, instance: EntityInstance) -> Result<EntityInstance, StoreError>;

    /// Merge `patch` into an existing instance. `None` when the id is unknown.
    async fn update(
        &self,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<EntityInstance>, StoreError>;

    /// Remove an instance. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    by_id: HashMap<String, EntityInstance>,
    order: Vec<String>,
}

/// In-memory store keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_all(&self) -> Result<Vec<EntityInstance>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.by_id.get(id).cloned())
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<EntityInstance>, StoreError> {
        Ok(self.state.read().await.by_id.get(id).cloned())
    }

    async fn create(&self, instance: EntityInstance) -> Result<EntityInstance, StoreError> {
        let mut state = self.state.write().await;
        if !state.by_id.contains_key(&instance.id) {
            state.order.push(instance.id.clone());
        }
        state.by_id.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn update(
        &self,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<EntityInstance>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.by_id.get_mut(id).map(|instance| {
            instance.merge(&patch);
            instance.clone()
        }))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let existed = state.by_id.remove(id).is_some();
        if existed {
            state.order.retain(|x| x != id);
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.by_id.clear();
        state.order.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// All instances of one entity persisted as a single JSON array.
///
/// Every operation reads the file, applies the change and writes it back
/// while holding an internal lock, so operations through one handle are
/// serialized. A missing file reads as empty.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<EntityInstance>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, instances: &[EntityInstance]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(instances)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get_all(&self) -> Result<Vec<EntityInstance>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<EntityInstance>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|i| i.id == id))
    }

    async fn create(&self, instance: EntityInstance) -> Result<EntityInstance, StoreError> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        match all.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance.clone(),
            None => all.push(instance.clone()),
        }
        self.save(&all).await?;
        Ok(instance)
    }

    async fn update(
        &self,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<EntityInstance>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let Some(instance) = all.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };
        instance.merge(&patch);
        let updated = instance.clone();
        self.save(&all).await?;
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut all = self.load().await?;
        let before = all.len();
        all.retain(|i| i.id != id);
        if all.len() == before {
            return Ok(false);
        }
        self.save(&all).await?;
        Ok(true)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.save(&[]).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
