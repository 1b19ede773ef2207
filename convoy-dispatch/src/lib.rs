//! Batched at-least-once delivery of conversion events
//!
//! This crate provides functionality to:
//! - Model captured conversion events and their terminal delivery states
//! - Partition undelivered events by tracking destination
//! - Expire stale events and bound retries for broken destinations
//! - Drive one bulk send per partition through an external ingestion client
//!
//! Persistence and the destination API sit behind narrow ports
//! ([`EventRepository`], [`IngestionClient`]); everything else is an
//! in-process control layer.

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ingest;
pub mod memory;
pub mod repository;

pub use dispatcher::{DispatchSummary, DispatcherConfig, EventDispatcher, Signal};
pub use error::{DispatchError, IngestionError, RepositoryError};
pub use event::{ConversionEvent, DeliveryState, EventId, PartitionCredential};
pub use ingest::{IngestAck, IngestionClient};
pub use memory::MemoryEventRepository;
pub use repository::EventRepository;
