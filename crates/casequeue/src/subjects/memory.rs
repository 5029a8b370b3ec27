use crate::error::{QueueError, Result};
use crate::subjects::{EntityStore, Versioned};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// In-process subject store. An optional latency is awaited inside every
/// load and save so tests can widen the window between read and write.
#[derive(Clone)]
pub struct MemorySubjectStore<E> {
    records: Arc<Mutex<HashMap<String, Versioned<E>>>>,
    latency: Option<Duration>,
}

impl<E> Default for MemorySubjectStore<E> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            latency: None,
        }
    }
}

impl<E: Clone + Send + Sync + 'static> MemorySubjectStore<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn get(&self, key: &str) -> Option<Versioned<E>> {
        self.records.lock().get(key).cloned()
    }

    async fn pause(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> EntityStore for MemorySubjectStore<E> {
    type Entity = E;

    async fn load(&self, key: &str) -> Result<Option<Versioned<E>>> {
        let found = self.records.lock().get(key).cloned();
        self.pause().await;
        Ok(found)
    }

    async fn save(&self, key: &str, entity: &E, expected_version: i64) -> Result<i64> {
        self.pause().await;
        let mut records = self.records.lock();
        let current = records
            .get_mut(key)
            .ok_or_else(|| QueueError::EntityNotFound(key.to_string()))?;
        if current.version != expected_version {
            return Err(QueueError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
            });
        }
        current.value = entity.clone();
        current.version += 1;
        Ok(current.version)
    }

    async fn put(&self, key: &str, entity: &E) -> Result<i64> {
        let mut records = self.records.lock();
        let version = records.get(key).map_or(1, |r| r.version + 1);
        records.insert(
            key.to_string(),
            Versioned {
                value: entity.clone(),
                version,
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemorySubjectStore::<u32>::new();
        store.put("c-1", &1).await.unwrap();

        let v = store.load("c-1").await.unwrap().unwrap();
        assert_eq!(store.save("c-1", &2, v.version).await.unwrap(), 2);

        let err = store.save("c-1", &3, v.version).await.unwrap_err();
        assert!(matches!(err, QueueError::VersionConflict { expected: 1, .. }));
        assert_eq!(store.get("c-1").unwrap().value, 2);
    }

    #[tokio::test]
    async fn saving_a_missing_key_fails() {
        let store = MemorySubjectStore::<u32>::new();
        let err = store.save("ghost", &1, 1).await.unwrap_err();
        assert!(matches!(err, QueueError::EntityNotFound(_)));
    }
}
