//! Long-lived subject records (client files) that job handlers write results
//! back to, and the per-key serializer that keeps those writes from racing.

pub mod memory;
pub mod repo;
pub mod serializer;

pub use memory::MemorySubjectStore;
pub use repo::PgSubjectStore;
pub use serializer::{EntityUpdateSerializer, KeyedSerializer};

use crate::error::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<E> {
    pub value: E,
    pub version: i64,
}

/// Storage for subject entities. `save` is conditional on the version the
/// caller loaded and fails with `QueueError::VersionConflict` when another
/// writer got there first.
#[async_trait]
pub trait EntityStore: Send + Sync {
    type Entity: Clone + Send + Sync + 'static;

    async fn load(&self, key: &str) -> Result<Option<Versioned<Self::Entity>>>;

    /// Returns the new version.
    async fn save(&self, key: &str, entity: &Self::Entity, expected_version: i64) -> Result<i64>;

    /// Unconditional create-or-replace, for seeding and imports.
    async fn put(&self, key: &str, entity: &Self::Entity) -> Result<i64>;
}
