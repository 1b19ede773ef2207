//! External ingestion client port
//!
//! One bulk call per partition per run. The acknowledgment is trusted as
//! all-or-nothing: the destination either received the whole batch or the
//! call failed. Partial-batch acknowledgment is not modeled.

use async_trait::async_trait;

use crate::{
    error::IngestionError,
    event::{ConversionEvent, PartitionCredential},
};

/// Acknowledgment returned by a successful bulk send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestAck {
    /// How many events the destination reports having received
    pub events_received: usize,
    /// Destination-side trace identifier, logged for support escalations
    pub trace_id: String,
}

/// Port for the external ad-tracking ingestion API.
#[async_trait]
pub trait IngestionClient: Send + Sync + std::fmt::Debug {
    /// Bulk-deliver one partition's events using that partition's
    /// credential.
    ///
    /// Each event's dedup key makes redelivery of the same logical event
    /// idempotent on the receiving side.
    ///
    /// # Errors
    /// [`IngestionError`] on any transport or destination-side failure; the
    /// dispatcher treats every variant as transient.
    async fn send_events(
        &self,
        events: &[ConversionEvent],
        credential: &PartitionCredential,
    ) -> Result<IngestAck, IngestionError>;
}
