//! Conversion-event data model

use std::{fmt, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a captured conversion event
///
/// A ULID: lexicographically sortable by creation time and
/// collision-resistant, so bulk updates can name events without
/// coordination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventId(ulid::Ulid);

impl EventId {
    /// Create an id from an existing ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self(id)
    }

    /// Generate a new unique event id
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// The underlying ULID
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery lifecycle of a conversion event.
///
/// `Unsent` is the only non-terminal state: an event transitions exactly
/// once, to `Sent`, `Expired`, or `Failed`, and is never re-sent afterward.
/// That invariant is what makes concurrent or duplicate dispatcher runs
/// safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryState {
    /// Awaiting delivery
    Unsent,
    /// Acknowledged by the destination in a bulk send
    Sent,
    /// Older than the destination's acceptance window; never sent
    Expired,
    /// Retry ceiling exceeded; abandoned
    Failed,
}

impl DeliveryState {
    /// Whether this state permits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Unsent)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsent => "UNSENT",
            Self::Sent => "SENT",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        })
    }
}

/// One row per attempted delivery of a captured conversion.
///
/// Created by upstream event capture; mutated only by the dispatcher
/// through the repository's bulk operations; never deleted by this
/// subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    /// Unique event identifier
    pub id: EventId,

    /// Destination identifier (e.g. a tracking-pixel id) used to group
    /// events and select credentials (Arc for cheap cloning across groups)
    pub partition_key: Arc<str>,

    /// Idempotency token handed to the external API, distinct from `id`;
    /// repeated delivery of the same logical event is deduplicated on the
    /// receiving side
    pub dedup_key: String,

    /// When the conversion occurred; immutable, used for staleness
    pub occurred_at: DateTime<Utc>,

    /// Current delivery lifecycle state
    pub delivery_state: DeliveryState,

    /// Number of failed bulk-send attempts while the event remained unsent;
    /// increases monotonically and only while `Unsent`
    pub retry_count: u32,

    /// When the event row was created
    pub created_at: DateTime<Utc>,
}

impl ConversionEvent {
    /// Create a new unsent event.
    #[must_use]
    pub fn new(
        partition_key: impl Into<Arc<str>>,
        dedup_key: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            partition_key: partition_key.into(),
            dedup_key: dedup_key.into(),
            occurred_at,
            delivery_state: DeliveryState::Unsent,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Whether the event's age at `now` exceeds the destination's
    /// acceptance window.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        now - self.occurred_at > window
    }
}

/// Read-only mapping from a partition to the credential used for its bulk
/// sends.
///
/// Resolved once per dispatcher run and never cached across runs, so
/// credential rotation takes effect by the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionCredential {
    /// The partition this credential belongs to
    pub partition_key: Arc<str>,

    /// Destination-side account/property identifier
    pub destination_id: String,

    /// Secret presented to the ingestion API
    pub secret: String,
}
