//! In-memory event repository
//!
//! Backs integration tests and transient embedders. Enforces the
//! terminal-state invariant at the storage layer: once an event is SENT,
//! EXPIRED, or FAILED, no bulk operation moves it again, so duplicate or
//! concurrent dispatcher runs stay harmless.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    error::RepositoryError,
    event::{ConversionEvent, DeliveryState, EventId, PartitionCredential},
    repository::EventRepository,
};

/// DashMap-backed [`EventRepository`] implementation.
#[derive(Debug, Default)]
pub struct MemoryEventRepository {
    events: DashMap<EventId, ConversionEvent>,
    credentials: DashMap<std::sync::Arc<str>, PartitionCredential>,
}

impl MemoryEventRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a captured event.
    pub fn insert(&self, event: ConversionEvent) {
        self.events.insert(event.id, event);
    }

    /// Register a partition credential.
    pub fn insert_credential(&self, credential: PartitionCredential) {
        self.credentials
            .insert(credential.partition_key.clone(), credential);
    }

    /// Look up an event by id.
    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<ConversionEvent> {
        self.events.get(id).map(|entry| entry.value().clone())
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn transition(&self, ids: &[EventId], state: DeliveryState) {
        for id in ids {
            if let Some(mut entry) = self.events.get_mut(id) {
                let event = entry.value_mut();
                // Terminal states never move again.
                if !event.delivery_state.is_terminal() {
                    event.delivery_state = state;
                }
            }
        }
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn find_unsent_events(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversionEvent>, RepositoryError> {
        let mut unsent: Vec<ConversionEvent> = self
            .events
            .iter()
            .filter(|entry| entry.value().delivery_state == DeliveryState::Unsent)
            .map(|entry| entry.value().clone())
            .collect();

        // Oldest first; ids are time-ordered ULIDs.
        unsent.sort_by_key(|event| event.id);
        unsent.truncate(limit);
        Ok(unsent)
    }

    async fn find_partition_credentials(
        &self,
    ) -> Result<Vec<PartitionCredential>, RepositoryError> {
        Ok(self
            .credentials
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_batch(
        &self,
        ids: &[EventId],
        state: DeliveryState,
    ) -> Result<(), RepositoryError> {
        debug_assert!(matches!(
            state,
            DeliveryState::Sent | DeliveryState::Failed
        ));
        self.transition(ids, state);
        Ok(())
    }

    async fn mark_expired_batch(&self, ids: &[EventId]) -> Result<(), RepositoryError> {
        self.transition(ids, DeliveryState::Expired);
        Ok(())
    }

    async fn increment_retry_batch(&self, ids: &[EventId]) -> Result<(), RepositoryError> {
        for id in ids {
            if let Some(mut entry) = self.events.get_mut(id) {
                let event = entry.value_mut();
                if event.delivery_state == DeliveryState::Unsent {
                    event.retry_count += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn event(partition: &str) -> ConversionEvent {
        ConversionEvent::new(partition, format!("dedup-{}", ulid::Ulid::new()), Utc::now())
    }

    #[tokio::test]
    async fn find_unsent_respects_limit_and_skips_terminal() {
        let repo = MemoryEventRepository::new();
        for _ in 0..5 {
            repo.insert(event("p1"));
        }
        let sent = event("p1");
        let sent_id = sent.id;
        repo.insert(sent);
        repo.mark_batch(&[sent_id], DeliveryState::Sent).await.unwrap();

        let page = repo.find_unsent_events(3).await.unwrap();
        assert_eq!(page.len(), 3);

        let all = repo.find_unsent_events(100).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|e| e.id != sent_id));
    }

    #[tokio::test]
    async fn terminal_states_never_move_again() {
        let repo = MemoryEventRepository::new();
        let e = event("p1");
        let id = e.id;
        repo.insert(e);

        repo.mark_expired_batch(&[id]).await.unwrap();
        assert_eq!(repo.get(&id).unwrap().delivery_state, DeliveryState::Expired);

        // Subsequent bulk updates must not resurrect the event.
        repo.mark_batch(&[id], DeliveryState::Sent).await.unwrap();
        assert_eq!(repo.get(&id).unwrap().delivery_state, DeliveryState::Expired);

        repo.increment_retry_batch(&[id]).await.unwrap();
        assert_eq!(repo.get(&id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn retry_counts_increment_only_while_unsent() {
        let repo = MemoryEventRepository::new();
        let e = event("p1");
        let id = e.id;
        repo.insert(e);

        repo.increment_retry_batch(&[id]).await.unwrap();
        repo.increment_retry_batch(&[id]).await.unwrap();
        assert_eq!(repo.get(&id).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn credentials_round_trip() {
        let repo = MemoryEventRepository::new();
        repo.insert_credential(PartitionCredential {
            partition_key: "pixel-1".into(),
            destination_id: "dest-1".to_string(),
            secret: "s3cret".to_string(),
        });

        let credentials = repo.find_partition_credentials().await.unwrap();
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].destination_id, "dest-1");
    }
}
