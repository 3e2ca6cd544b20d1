//! Durable key/value state kept on the device
//!
//! Plain get/set/remove over a fixed key set. No transactions across keys.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::error::LocalStoreError;

/// Keys the engine reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    /// Last decided UI status label
    SubscriptionStatus,
    TrialStartDate,
    DaysRemaining,
    RestoreAttempted,
    RestoreSucceeded,
    UserId,
    AuthToken,
}

impl StoreKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionStatus => "subscription_status",
            Self::TrialStartDate => "trial_start_date",
            Self::DaysRemaining => "days_remaining",
            Self::RestoreAttempted => "restore_attempted",
            Self::RestoreSucceeded => "restore_succeeded",
            Self::UserId => "user_id",
            Self::AuthToken => "auth_token",
        }
    }
}

#[async_trait]
pub trait LocalStateStore: Send + Sync {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, LocalStoreError>;

    async fn set(&self, key: StoreKey, value: &str) -> Result<(), LocalStoreError>;

    async fn remove(&self, key: StoreKey) -> Result<(), LocalStoreError>;

    /// Boolean flags are stored as "true"/"false"; anything else reads false
    async fn get_flag(&self, key: StoreKey) -> Result<bool, LocalStoreError> {
        Ok(self.get(key).await?.as_deref() == Some("true"))
    }

    async fn set_flag(&self, key: StoreKey, value: bool) -> Result<(), LocalStoreError> {
        self.set(key, if value { "true" } else { "false" }).await
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryStateStore {
    values: DashMap<StoreKey, String>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStateStore for InMemoryStateStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, LocalStoreError> {
        Ok(self.values.get(&key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: StoreKey, value: &str) -> Result<(), LocalStoreError> {
        self.values.insert(key, value.to_string());
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<(), LocalStoreError> {
        self.values.remove(&key);
        Ok(())
    }
}

// =============================================================================
// JSON file
// =============================================================================

/// Whole-file JSON store. Every write rewrites the file through a temp file
/// and rename.
pub struct JsonFileStateStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStateStore {
    /// Open the store, loading existing values. A missing file is empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LocalStoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), LocalStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStateStore for JsonFileStateStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, LocalStoreError> {
        Ok(self.values.lock().await.get(key.as_str()).cloned())
    }

    async fn set(&self, key: StoreKey, value: &str) -> Result<(), LocalStoreError> {
        let mut values = self.values.lock().await;
        values.insert(key.as_str().to_string(), value.to_string());
        self.persist(&values).await
    }

    async fn remove(&self, key: StoreKey) -> Result<(), LocalStoreError> {
        let mut values = self.values.lock().await;
        if values.remove(key.as_str()).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_flags() {
        let store = InMemoryStateStore::new();
        assert!(!store.get_flag(StoreKey::RestoreAttempted).await.unwrap());

        store.set_flag(StoreKey::RestoreAttempted, true).await.unwrap();
        assert!(store.get_flag(StoreKey::RestoreAttempted).await.unwrap());

        store.set(StoreKey::RestoreAttempted, "yes").await.unwrap();
        assert!(!store.get_flag(StoreKey::RestoreAttempted).await.unwrap());

        store.remove(StoreKey::RestoreAttempted).await.unwrap();
        assert_eq!(store.get(StoreKey::RestoreAttempted).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("subscription.json");

        {
            let store = JsonFileStateStore::open(&path).await.unwrap();
            store.set(StoreKey::UserId, "alice").await.unwrap();
            store.set(StoreKey::SubscriptionStatus, "trial").await.unwrap();
            store.remove(StoreKey::SubscriptionStatus).await.unwrap();
        }

        let store = JsonFileStateStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(StoreKey::UserId).await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(store.get(StoreKey::SubscriptionStatus).await.unwrap(), None);

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"user_id\""));
    }

    #[tokio::test]
    async fn test_json_file_rejects_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(matches!(
            JsonFileStateStore::open(&path).await,
            Err(LocalStoreError::Serde(_))
        ));
    }
}
