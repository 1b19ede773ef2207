//! Configurable mock ingestion client for dispatcher tests
//!
//! Records every bulk call for verification and injects per-partition
//! failures.
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use convoy_dispatch::{
    ConversionEvent, EventId, IngestAck, IngestionClient, IngestionError, MemoryEventRepository,
    PartitionCredential,
};
use parking_lot::Mutex;

/// One recorded `send_events` invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub partition_key: String,
    pub destination_id: String,
    pub event_ids: Vec<EventId>,
    pub dedup_keys: Vec<String>,
}

/// Mock [`IngestionClient`] with builder-style failure injection.
#[derive(Debug, Default)]
pub struct MockIngestionClient {
    failing_partitions: HashSet<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockIngestionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bulk send for `partition` fail with a transport error.
    #[must_use]
    pub fn with_failing_partition(mut self, partition: &str) -> Self {
        self.failing_partitions.insert(partition.to_string());
        self
    }

    /// All calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// The single call made against `partition`, if exactly one was made.
    pub fn call_for_partition(&self, partition: &str) -> Option<RecordedCall> {
        let calls = self.calls.lock();
        let mut matching = calls.iter().filter(|call| call.partition_key == partition);
        let found = matching.next().cloned();
        assert!(matching.next().is_none(), "multiple calls for {partition}");
        found
    }
}

#[async_trait]
impl IngestionClient for MockIngestionClient {
    async fn send_events(
        &self,
        events: &[ConversionEvent],
        credential: &PartitionCredential,
    ) -> Result<IngestAck, IngestionError> {
        let mut calls = self.calls.lock();
        let trace_id = format!("trace-{}", calls.len());
        calls.push(RecordedCall {
            partition_key: credential.partition_key.to_string(),
            destination_id: credential.destination_id.clone(),
            event_ids: events.iter().map(|event| event.id).collect(),
            dedup_keys: events.iter().map(|event| event.dedup_key.clone()).collect(),
        });
        drop(calls);

        if self
            .failing_partitions
            .contains(credential.partition_key.as_ref())
        {
            return Err(IngestionError::Transport(
                "connection reset by destination".to_string(),
            ));
        }

        Ok(IngestAck {
            events_received: events.len(),
            trace_id,
        })
    }
}

/// Build an unsent event for `partition` that occurred `age_days` ago.
pub fn aged_event(partition: &str, age_days: i64) -> ConversionEvent {
    event_at(partition, Utc::now() - TimeDelta::days(age_days))
}

/// Build an unsent event for `partition` at an explicit timestamp.
pub fn event_at(partition: &str, occurred_at: DateTime<Utc>) -> ConversionEvent {
    ConversionEvent::new(
        partition,
        format!("dedup-{}", ulid::Ulid::new()),
        occurred_at,
    )
}

/// Register a credential for `partition` on the repository.
pub fn credential_for(repository: &MemoryEventRepository, partition: &str) {
    repository.insert_credential(PartitionCredential {
        partition_key: partition.into(),
        destination_id: format!("dest-{partition}"),
        secret: format!("secret-{partition}"),
    });
}
