//! Entity persistence with optimistic concurrency.
//!
//! Every write goes through [`EntityStore::update`], which only applies
//! when the caller read the version it is replacing. Losing a race is an
//! ordinary [`StoreError::Conflict`]; callers re-read and re-apply.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::{Entity, EntityId};
use crate::errors::StoreError;

/// Durable home of [`Entity`] records.
///
/// `update` is compare-and-swap on [`Entity::version`]: the write applies
/// only if the stored version still equals the version the caller loaded,
/// and the stored copy gets `version + 1`. All coordinator transitions are
/// read-modify-write loops over this seam.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Inserts a freshly registered entity.
    async fn insert(&self, entity: Entity) -> Result<(), StoreError>;

    /// Loads an entity by id.
    async fn load(&self, id: EntityId) -> Result<Entity, StoreError>;

    /// Compare-and-swap write. Returns the stored copy, version bumped.
    async fn update(&self, entity: Entity) -> Result<Entity, StoreError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: DashMap<EntityId, Entity>,
}

impl InMemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when no entity has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert(&self, entity: Entity) -> Result<(), StoreError> {
        let id = entity.id;
        match self.entities.entry(id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists { id }),
            Entry::Vacant(slot) => {
                slot.insert(entity);
                Ok(())
            }
        }
    }

    async fn load(&self, id: EntityId) -> Result<Entity, StoreError> {
        self.entities
            .get(&id)
            .map(|entity| entity.clone())
            .ok_or(StoreError::NotFound { id })
    }

    async fn update(&self, mut entity: Entity) -> Result<Entity, StoreError> {
        // The entry guard pins the shard for the whole check-and-write, so
        // the version compare and the replacement are one atomic step.
        match self.entities.entry(entity.id) {
            Entry::Vacant(_) => Err(StoreError::NotFound { id: entity.id }),
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                if stored.version != entity.version {
                    return Err(StoreError::Conflict {
                        id: entity.id,
                        expected: entity.version,
                        actual: stored.version,
                    });
                }
                entity.version += 1;
                entity.updated_at = chrono::Utc::now();
                slot.insert(entity.clone());
                Ok(entity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LifecycleState, NewEntity, Stage};

    fn entity() -> Entity {
        Entity::register(NewEntity::new("https://example.com/a", "newsletter"))
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = InMemoryEntityStore::new();
        let e = entity();
        let id = e.id;
        store.insert(e).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.state, LifecycleState::Pending);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_insert_twice_rejected() {
        let store = InMemoryEntityStore::new();
        let e = entity();
        store.insert(e.clone()).await.unwrap();
        let err = store.insert(e).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = InMemoryEntityStore::new();
        let err = store.load(EntityId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = InMemoryEntityStore::new();
        let e = entity();
        let id = e.id;
        store.insert(e).await.unwrap();

        let mut loaded = store.load(id).await.unwrap();
        loaded.set_state(LifecycleState::Running {
            stage: Stage::Prospect,
        });
        let written = store.update(loaded).await.unwrap();
        assert_eq!(written.version, 1);
        assert_eq!(written.state_version, 1);

        let reloaded = store.load(id).await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert!(reloaded.state.is_running());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryEntityStore::new();
        let e = entity();
        let id = e.id;
        store.insert(e).await.unwrap();

        let first = store.load(id).await.unwrap();
        let second = first.clone();

        store.update(first).await.unwrap();
        let err = store.update(second).await.unwrap_err();
        assert!(err.is_conflict());
        match err {
            StoreError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_conflicted_writer_can_retry_from_fresh_read() {
        let store = InMemoryEntityStore::new();
        let e = entity();
        let id = e.id;
        store.insert(e).await.unwrap();

        let stale = store.load(id).await.unwrap();
        let mut current = store.load(id).await.unwrap();
        current.set_state(LifecycleState::Running {
            stage: Stage::Prospect,
        });
        store.update(current).await.unwrap();

        assert!(store.update(stale).await.is_err());

        let mut fresh = store.load(id).await.unwrap();
        fresh.set_state(LifecycleState::AwaitingUser {
            stage: Stage::Prospect,
        });
        let written = store.update(fresh).await.unwrap();
        assert_eq!(written.version, 2);
        assert_eq!(written.state_version, 2);
    }
}
