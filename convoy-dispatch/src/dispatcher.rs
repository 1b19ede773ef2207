//! Conversion-event dispatcher
//!
//! A batch job, invoked periodically, that drains the backlog of undelivered
//! tracking events:
//! 1. Fetch a bounded page of UNSENT events
//! 2. Bulk-expire events older than the destination's acceptance window
//!    (sending them would be rejected anyway — no network call is wasted,
//!    and they are not counted as dependency failures)
//! 3. Bulk-fail events already past the retry ceiling, bounding delivery
//!    attempts for a permanently-broken destination
//! 4. Group the remainder by partition, resolve credentials once for the
//!    run, and issue exactly one bulk send per partition
//!
//! Partitions are processed with bounded parallelism and full isolation:
//! one partition's failure never prevents another's delivery. The
//! terminal-state invariant on events — not any ordering guarantee — is
//! what makes duplicate or concurrent runs safe.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    error::DispatchError,
    event::{ConversionEvent, DeliveryState, EventId, PartitionCredential},
    ingest::IngestionClient,
    repository::EventRepository,
};

/// Shutdown signalling for the periodic serve loop
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    /// Stop after the current run completes
    Shutdown,
}

/// Configuration for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum event age accepted by the destination (seconds); older
    /// events are expired instead of sent
    ///
    /// Default: 604800 (7 days)
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    /// Delivery attempts allowed per event; an event whose retry count
    /// already exceeds this is failed outright
    ///
    /// Default: 3
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Maximum partitions processed in parallel within one run
    ///
    /// Default: 4
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,

    /// Bounded page size for the unsent-event fetch
    ///
    /// Default: 500
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,

    /// How often the serve loop triggers a run (seconds)
    ///
    /// Default: 60
    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: default_staleness_window_secs(),
            retry_ceiling: default_retry_ceiling(),
            max_concurrent_partitions: default_max_concurrent_partitions(),
            fetch_limit: default_fetch_limit(),
            process_interval_secs: default_process_interval_secs(),
        }
    }
}

const fn default_staleness_window_secs() -> u64 {
    604_800 // 7 days
}

const fn default_retry_ceiling() -> u32 {
    3
}

const fn default_max_concurrent_partitions() -> usize {
    4
}

const fn default_fetch_limit() -> usize {
    500
}

const fn default_process_interval_secs() -> u64 {
    60
}

/// Per-run outcome counts, aggregated across all partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Events fetched for this run
    pub processed: usize,
    /// Events acknowledged by a bulk send
    pub sent: usize,
    /// Events expired for staleness without a network call
    pub expired: usize,
    /// Events failed: past the retry ceiling, or part of a partition whose
    /// bulk send failed this run (retry-incremented for a later run)
    pub failed: usize,
}

/// One partition's share of a run.
struct PartitionBatch {
    partition: Arc<str>,
    credential: Option<PartitionCredential>,
    events: Vec<ConversionEvent>,
}

/// Batched at-least-once dispatcher for conversion events.
///
/// Holds no mutable state across runs beyond what is persisted through the
/// repository; runs are idempotent because event state transitions are
/// terminal.
#[derive(Debug)]
pub struct EventDispatcher {
    config: DispatcherConfig,
    repository: Arc<dyn EventRepository>,
    ingestion: Arc<dyn IngestionClient>,
}

impl EventDispatcher {
    /// Create a dispatcher over the given ports.
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        repository: Arc<dyn EventRepository>,
        ingestion: Arc<dyn IngestionClient>,
    ) -> Self {
        Self {
            config,
            repository,
            ingestion,
        }
    }

    /// Execute one dispatch run.
    ///
    /// Never fails for per-partition send errors — those are accounted in
    /// the returned summary.
    ///
    /// # Errors
    /// [`DispatchError::Repository`] if the fetch/triage repository
    /// operations fail; nothing has been sent when that happens.
    pub async fn run(&self) -> Result<DispatchSummary, DispatchError> {
        let now = Utc::now();

        let events = self
            .repository
            .find_unsent_events(self.config.fetch_limit)
            .await?;
        if events.is_empty() {
            debug!("no pending conversion events");
            return Ok(DispatchSummary::default());
        }

        let mut summary = DispatchSummary {
            processed: events.len(),
            ..DispatchSummary::default()
        };

        // Stale events are expired without a network call.
        let window = TimeDelta::seconds(
            i64::try_from(self.config.staleness_window_secs).unwrap_or(i64::MAX),
        );
        let (stale, active): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|event| event.is_stale(now, window));

        if !stale.is_empty() {
            let ids: Vec<EventId> = stale.iter().map(|event| event.id).collect();
            warn!(count = ids.len(), "expiring stale conversion events");
            self.repository.mark_expired_batch(&ids).await?;
            summary.expired = ids.len();
        }

        // Events past the retry ceiling are failed outright and excluded
        // from this run's network traffic.
        let (exhausted, sendable): (Vec<_>, Vec<_>) = active
            .into_iter()
            .partition(|event| event.retry_count > self.config.retry_ceiling);

        if !exhausted.is_empty() {
            let ids: Vec<EventId> = exhausted.iter().map(|event| event.id).collect();
            warn!(
                count = ids.len(),
                retry_ceiling = self.config.retry_ceiling,
                "abandoning events past the retry ceiling"
            );
            self.repository
                .mark_batch(&ids, DeliveryState::Failed)
                .await?;
            summary.failed = ids.len();
        }

        if sendable.is_empty() {
            return Ok(summary);
        }

        // Group by partition; resolve credentials once for the whole run.
        let mut groups: HashMap<Arc<str>, Vec<ConversionEvent>> = HashMap::new();
        for event in sendable {
            groups
                .entry(Arc::clone(&event.partition_key))
                .or_default()
                .push(event);
        }

        let mut credentials: HashMap<Arc<str>, PartitionCredential> = self
            .repository
            .find_partition_credentials()
            .await?
            .into_iter()
            .map(|credential| (Arc::clone(&credential.partition_key), credential))
            .collect();

        let batches = groups.into_iter().map(|(partition, events)| {
            let credential = credentials.remove(&partition);
            PartitionBatch {
                partition,
                credential,
                events,
            }
        });

        // Bounded-parallel partition sends: spawn an initial window of
        // tasks, then refill as each completes. Isolation is total — a
        // panic or failure in one partition's task never blocks the rest.
        let mut join_set: JoinSet<(usize, bool)> = JoinSet::new();
        let mut batch_iter = batches.into_iter();

        let initial = self.config.max_concurrent_partitions.max(1);
        for batch in batch_iter.by_ref().take(initial) {
            join_set.spawn(send_partition(
                Arc::clone(&self.repository),
                Arc::clone(&self.ingestion),
                batch,
            ));
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((count, true)) => summary.sent += count,
                Ok((count, false)) => summary.failed += count,
                Err(join_error) => {
                    error!(error = %join_error, "partition task aborted");
                }
            }

            if let Some(batch) = batch_iter.next() {
                join_set.spawn(send_partition(
                    Arc::clone(&self.repository),
                    Arc::clone(&self.ingestion),
                    batch,
                ));
            }
        }

        Ok(summary)
    }

    /// Drive [`run`](Self::run) on a fixed interval until shutdown.
    ///
    /// An external scheduler can call `run()` directly instead; this loop
    /// exists for deployments that embed the dispatcher as a long-lived
    /// task.
    ///
    /// # Errors
    /// Currently infallible in practice — individual run failures are
    /// logged and the loop continues — but the signature leaves room for
    /// fatal startup conditions.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.process_interval_secs.max(1)));
        // Skip the immediate first tick.
        timer.tick().await;

        info!(
            interval_secs = self.config.process_interval_secs,
            "conversion dispatcher started"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.run().await {
                        Ok(summary) if summary.processed > 0 => {
                            info!(
                                processed = summary.processed,
                                sent = summary.sent,
                                expired = summary.expired,
                                failed = summary.failed,
                                "dispatch run complete"
                            );
                        }
                        Ok(_) => debug!("dispatch run found no pending events"),
                        Err(run_error) => {
                            error!(error = %run_error, "dispatch run failed");
                        }
                    }
                }
                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Shutdown) => {
                            info!("conversion dispatcher received shutdown signal");
                            break;
                        }
                        Err(recv_error) => {
                            error!(error = %recv_error, "dispatcher shutdown channel closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Send one partition's batch and record the outcome in bulk.
///
/// Returns the batch size and whether the events were delivered. A missing
/// credential is treated like a failed send (retry-incremented) so that
/// credential rotation lag self-heals instead of terminally failing events.
async fn send_partition(
    repository: Arc<dyn EventRepository>,
    ingestion: Arc<dyn IngestionClient>,
    batch: PartitionBatch,
) -> (usize, bool) {
    let ids: Vec<EventId> = batch.events.iter().map(|event| event.id).collect();
    let count = ids.len();

    let Some(credential) = batch.credential else {
        warn!(
            partition = %batch.partition,
            count,
            "no credential resolved for partition, deferring events"
        );
        if let Err(repo_error) = repository.increment_retry_batch(&ids).await {
            error!(
                partition = %batch.partition,
                error = %repo_error,
                "failed to defer credentialless batch"
            );
        }
        return (count, false);
    };

    match ingestion.send_events(&batch.events, &credential).await {
        Ok(ack) => {
            info!(
                partition = %batch.partition,
                count,
                events_received = ack.events_received,
                trace_id = %ack.trace_id,
                "partition batch delivered"
            );
            // The bulk acknowledgment is trusted as all-or-nothing; the
            // whole group is marked SENT regardless of any finer-grained
            // detail in the ack.
            if let Err(repo_error) = repository.mark_batch(&ids, DeliveryState::Sent).await {
                // Delivery happened; the dedup key makes the redundant
                // retry on the next run harmless at the destination.
                error!(
                    partition = %batch.partition,
                    error = %repo_error,
                    "failed to record sent batch"
                );
            }
            (count, true)
        }
        Err(send_error) => {
            warn!(
                partition = %batch.partition,
                count,
                error = %send_error,
                "partition batch failed, deferring for retry"
            );
            if let Err(repo_error) = repository.increment_retry_batch(&ids).await {
                error!(
                    partition = %batch.partition,
                    error = %repo_error,
                    "failed to record retry for partition batch"
                );
            }
            (count, false)
        }
    }
}
