//! Repository port for pending conversion events
//!
//! The dispatcher touches persistence only through this trait, and only
//! through batch operations: one bulk update per outcome per run, never a
//! per-event write. Implementations map to whatever the platform stores
//! events in; the dispatcher does not care.

use async_trait::async_trait;

use crate::{
    error::RepositoryError,
    event::{ConversionEvent, DeliveryState, EventId, PartitionCredential},
};

/// Port consumed by the dispatcher for event reads and bulk state updates.
#[async_trait]
pub trait EventRepository: Send + Sync + std::fmt::Debug {
    /// Fetch a bounded page of events still awaiting delivery.
    ///
    /// # Errors
    /// [`RepositoryError`] if the underlying storage fails.
    async fn find_unsent_events(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversionEvent>, RepositoryError>;

    /// Resolve credentials for every known partition.
    ///
    /// Called once per run and never cached across runs, so credential
    /// rotation takes effect by the next run.
    ///
    /// # Errors
    /// [`RepositoryError`] if the underlying storage fails.
    async fn find_partition_credentials(
        &self,
    ) -> Result<Vec<PartitionCredential>, RepositoryError>;

    /// Mark a batch of events terminal as either [`DeliveryState::Sent`] or
    /// [`DeliveryState::Failed`].
    ///
    /// The same bulk primitive records both outcomes. Implementations must
    /// leave already-terminal events untouched.
    ///
    /// # Errors
    /// [`RepositoryError`] if the underlying storage fails.
    async fn mark_batch(
        &self,
        ids: &[EventId],
        state: DeliveryState,
    ) -> Result<(), RepositoryError>;

    /// Mark a batch of events [`DeliveryState::Expired`].
    ///
    /// # Errors
    /// [`RepositoryError`] if the underlying storage fails.
    async fn mark_expired_batch(&self, ids: &[EventId]) -> Result<(), RepositoryError>;

    /// Increment the retry count for a batch that failed transiently.
    ///
    /// Counts only move while an event is unsent; implementations must not
    /// touch terminal events.
    ///
    /// # Errors
    /// [`RepositoryError`] if the underlying storage fails.
    async fn increment_retry_batch(&self, ids: &[EventId]) -> Result<(), RepositoryError>;
}
