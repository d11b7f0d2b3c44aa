use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sync_common::retry::RetryPolicy;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::{Claim, DedupStore, Lease};
use crate::error::ConsumerError;
use crate::fingerprint::Fingerprint;
use crate::merge::{merge_batch, Incoming, MergedEntry, RecordKind};
use crate::sink::Sink;
use crate::source::{commit_positions, rewind_positions, ConsumedMessage, MessageSource};

/// Where the consumer is in its batch cycle. Exported as the `sync_consumer_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle = 0,
    Reading = 1,
    Deduping = 2,
    Merging = 3,
    Forwarding = 4,
    Committing = 5,
    Stopped = 6,
}

/// Running totals, logged periodically and when the consumer stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub consumed: u64,
    pub duplicates_skipped: u64,
    pub forwarded: u64,
    pub poison_pills: u64,
    pub errors: u64,
}

/// Reads record messages in batches, drops the ones already forwarded, merges customers with
/// inventory and hands the result to the sink.
///
/// Offsets move forward only once every document of a batch was accepted. Otherwise the claims
/// of the failed documents are released and the batch is read again after a backoff; the
/// documents that did go through are recognized as duplicates the second time around.
pub struct MergeConsumer {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn DedupStore>,
    sink: Arc<dyn Sink>,
    topics: HashMap<String, RecordKind>,
    batch_size: usize,
    poll_timeout: Duration,
    backoff: RetryPolicy,
    stats_interval: Duration,
    state: ConsumerState,
    stats: ConsumerStats,
}

impl MergeConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn DedupStore>,
        sink: Arc<dyn Sink>,
        customer_topic: &str,
        inventory_topic: &str,
    ) -> Self {
        let topics = HashMap::from([
            (customer_topic.to_owned(), RecordKind::Customer),
            (inventory_topic.to_owned(), RecordKind::Inventory),
        ]);

        Self {
            source,
            store,
            sink,
            topics,
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            backoff: RetryPolicy::new(
                u32::MAX,
                2,
                Duration::from_secs(1),
                Some(Duration::from_secs(30)),
            ),
            stats_interval: Duration::from_secs(60),
            state: ConsumerState::Idle,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Backoff used after a failed batch and while the dedup store is unavailable.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stats_interval(mut self, stats_interval: Duration) -> Self {
        self.stats_interval = stats_interval;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Consume until `shutdown` is cancelled. Waiting for messages is interrupted by shutdown,
    /// a batch that was already read runs through forwarding and committing first.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConsumerStats {
        info!(topics = ?self.topics.keys().collect::<Vec<_>>(), "merge consumer started");

        let mut failures: u32 = 0;
        let mut last_report = Instant::now();

        loop {
            self.set_state(ConsumerState::Reading);
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.source.next_batch(self.batch_size, self.poll_timeout) => batch,
            };

            let result = match batch {
                Ok(batch) => self.process_batch(batch, &shutdown).await,
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(_) => failures = 0,
                Err(ConsumerError::Interrupted) => break,
                Err(err) => {
                    let delay = self.backoff.time_until_next_retry(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        delay_ms = delay.as_millis() as u64,
                        "batch was not committed: {}",
                        err
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {},
                    }
                }
            }

            if last_report.elapsed() >= self.stats_interval {
                self.report();
                last_report = Instant::now();
            }
        }

        self.set_state(ConsumerState::Stopped);
        self.report();
        info!("merge consumer stopped");

        self.stats
    }

    /// Read one batch and handle it. Returns the number of documents forwarded.
    pub async fn poll_once(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<usize, ConsumerError> {
        self.set_state(ConsumerState::Reading);
        let batch = self
            .source
            .next_batch(self.batch_size, self.poll_timeout)
            .await?;

        self.process_batch(batch, shutdown).await
    }

    async fn process_batch(
        &mut self,
        batch: Vec<ConsumedMessage>,
        shutdown: &CancellationToken,
    ) -> Result<usize, ConsumerError> {
        if batch.is_empty() {
            self.set_state(ConsumerState::Idle);
            return Ok(0);
        }

        let start = Instant::now();
        debug!(messages = batch.len(), "processing batch");

        self.set_state(ConsumerState::Deduping);
        let mut fresh: Vec<Incoming> = Vec::new();
        let mut leases: HashMap<Fingerprint, Lease> = HashMap::new();

        for message in &batch {
            self.stats.consumed += 1;
            metrics::counter!("sync_consumer_messages_total", "topic" => message.topic.clone())
                .increment(1);

            let Some(incoming) = self.decode(message) else {
                continue;
            };

            // A payload repeated inside the batch would otherwise wait on our own lease.
            if leases.contains_key(&incoming.fingerprint) {
                self.skip_duplicate(message, &incoming.fingerprint);
                continue;
            }

            match self.claim(&incoming.fingerprint, shutdown).await {
                Ok(Claim::New(lease)) => {
                    leases.insert(incoming.fingerprint.clone(), lease);
                    fresh.push(incoming);
                }
                Ok(_) => self.skip_duplicate(message, &incoming.fingerprint),
                Err(err) => {
                    for (fingerprint, lease) in &leases {
                        self.release(fingerprint, lease).await;
                    }
                    self.source.rewind(rewind_positions(&batch)).await?;
                    return Err(err);
                }
            }
        }

        self.set_state(ConsumerState::Merging);
        let entries = merge_batch(fresh);

        self.set_state(ConsumerState::Forwarding);
        let merged_at = OffsetDateTime::now_utc();
        let mut failed = 0;
        for entry in &entries {
            if self.forward(entry, merged_at, &leases).await {
                for fingerprint in &entry.fingerprints {
                    if let Some(lease) = leases.get(fingerprint) {
                        self.confirm(fingerprint, lease).await;
                    }
                }
            } else {
                failed += 1;
                for fingerprint in &entry.fingerprints {
                    if let Some(lease) = leases.get(fingerprint) {
                        self.release(fingerprint, lease).await;
                    }
                }
            }
        }

        if failed > 0 {
            self.source.rewind(rewind_positions(&batch)).await?;
            self.set_state(ConsumerState::Idle);
            return Err(ConsumerError::ForwardFailed {
                failed,
                total: entries.len(),
            });
        }

        self.set_state(ConsumerState::Committing);
        self.source.commit(commit_positions(&batch)).await?;
        metrics::counter!("sync_consumer_commits_total").increment(1);
        metrics::histogram!("sync_consumer_batch_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        debug!(
            messages = batch.len(),
            forwarded = entries.len(),
            "batch committed"
        );
        self.set_state(ConsumerState::Idle);

        Ok(entries.len())
    }

    /// Turn a raw message into a mergeable record. Messages that can never be handled are
    /// logged, counted and left to be committed with the rest of the batch.
    fn decode(&mut self, message: &ConsumedMessage) -> Option<Incoming> {
        let Some(kind) = self.topics.get(&message.topic).copied() else {
            self.poison_pill(message, "unexpected topic");
            return None;
        };

        let payload = match message.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                self.poison_pill(message, "empty payload");
                return None;
            }
        };

        let value = match serde_json::from_slice::<Value>(payload) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                self.poison_pill(message, "payload is not a JSON object");
                return None;
            }
            Err(_) => {
                self.poison_pill(message, "payload is not valid JSON");
                return None;
            }
        };

        let fingerprint = Fingerprint::of(payload);
        let key = correlation_id(&value)
            .or_else(|| message.key.clone().filter(|key| !key.is_empty()))
            .unwrap_or_else(|| fingerprint.to_string());

        Some(Incoming {
            kind,
            key,
            payload: value,
            fingerprint,
        })
    }

    /// Claim `fingerprint`, failing closed: store errors and foreign leases are waited out.
    async fn claim(
        &mut self,
        fingerprint: &Fingerprint,
        shutdown: &CancellationToken,
    ) -> Result<Claim, ConsumerError> {
        let mut attempt: u32 = 0;

        loop {
            match self.store.check_and_mark(fingerprint).await {
                Ok(Claim::InFlight) => {
                    debug!(
                        fingerprint = fingerprint.short(),
                        "fingerprint is claimed by another reader, waiting"
                    );
                }
                Ok(claim) => return Ok(claim),
                Err(err) => {
                    self.stats.errors += 1;
                    metrics::counter!("sync_consumer_dedup_store_errors_total").increment(1);
                    warn!(attempt, "dedup store unavailable: {}", err);
                }
            }

            let delay = self.backoff.time_until_next_retry(attempt);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = shutdown.cancelled() => return Err(ConsumerError::Interrupted),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    /// Hand `entry` to the sink while holding the leases of its records. The leases are
    /// renewed before the first attempt and every third of a lease period while the sink is
    /// busy. Once one of them is lost the forward is abandoned: another reader owns the record.
    async fn forward(
        &mut self,
        entry: &MergedEntry,
        merged_at: OffsetDateTime,
        leases: &HashMap<Fingerprint, Lease>,
    ) -> bool {
        let result = match entry.document(merged_at) {
            Ok(document) => self.forward_holding(entry, &document, leases).await,
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                self.stats.forwarded += 1;
                metrics::counter!("sync_consumer_forwarded_total", "kind" => entry.kind())
                    .increment(1);
                debug!(key = %entry.key, kind = entry.kind(), "forwarded document");
                true
            }
            Err(err) => {
                self.stats.errors += 1;
                metrics::counter!("sync_consumer_forward_errors_total").increment(1);
                error!(key = %entry.key, "failed to forward document: {}", err);
                false
            }
        }
    }

    async fn forward_holding(
        &mut self,
        entry: &MergedEntry,
        document: &Value,
        leases: &HashMap<Fingerprint, Lease>,
    ) -> Result<(), String> {
        let period = (self.store.lease_duration() / 3).max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval(period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let sink = self.sink.clone();
        let forward = sink.forward(document);
        tokio::pin!(forward);

        // The first tick completes immediately, so the leases are renewed before the
        // forward is polled for the first time.
        let mut renewed = false;
        loop {
            tokio::select! {
                biased;
                _ = renewal.tick() => {
                    if !self.renew(entry, leases).await {
                        return Err("claim was lost before the forward completed".to_owned());
                    }
                    renewed = true;
                }
                result = &mut forward, if renewed => {
                    return result.map_err(|e| e.to_string());
                }
            }
        }
    }

    /// Renew every lease behind `entry`. A store error counts as losing the lease.
    async fn renew(&mut self, entry: &MergedEntry, leases: &HashMap<Fingerprint, Lease>) -> bool {
        for fingerprint in &entry.fingerprints {
            let Some(lease) = leases.get(fingerprint) else {
                return false;
            };

            match self.store.renew(fingerprint, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    metrics::counter!("sync_consumer_leases_lost_total").increment(1);
                    warn!(
                        key = %entry.key,
                        fingerprint = fingerprint.short(),
                        "fingerprint was claimed by another reader"
                    );
                    return false;
                }
                Err(err) => {
                    self.stats.errors += 1;
                    metrics::counter!("sync_consumer_dedup_store_errors_total").increment(1);
                    warn!(
                        fingerprint = fingerprint.short(),
                        "failed to renew claim: {}",
                        err
                    );
                    return false;
                }
            }
        }

        true
    }

    async fn confirm(&mut self, fingerprint: &Fingerprint, lease: &Lease) {
        // An unconfirmed claim decays into an expired lease, the offset is still committed.
        match self.store.confirm(fingerprint, lease).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!("sync_consumer_leases_lost_total").increment(1);
                warn!(
                    fingerprint = fingerprint.short(),
                    "claim was taken over before it could be confirmed"
                );
            }
            Err(err) => {
                self.stats.errors += 1;
                metrics::counter!("sync_consumer_dedup_store_errors_total").increment(1);
                warn!(
                    fingerprint = fingerprint.short(),
                    "failed to confirm forwarded fingerprint: {}",
                    err
                );
            }
        }
    }

    async fn release(&mut self, fingerprint: &Fingerprint, lease: &Lease) {
        if let Err(err) = self.store.release(fingerprint, lease).await {
            self.stats.errors += 1;
            metrics::counter!("sync_consumer_dedup_store_errors_total").increment(1);
            warn!(
                fingerprint = fingerprint.short(),
                "failed to release claim, it will expire with its lease: {}",
                err
            );
        }
    }

    fn skip_duplicate(&mut self, message: &ConsumedMessage, fingerprint: &Fingerprint) {
        self.stats.duplicates_skipped += 1;
        metrics::counter!(
            "sync_consumer_duplicates_skipped_total",
            "topic" => message.topic.clone()
        )
        .increment(1);
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            fingerprint = fingerprint.short(),
            "skipping duplicate message"
        );
    }

    fn poison_pill(&mut self, message: &ConsumedMessage, reason: &str) {
        self.stats.poison_pills += 1;
        metrics::counter!("sync_consumer_poison_pills_total").increment(1);
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "skipping unprocessable message: {}",
            reason
        );
    }

    fn set_state(&mut self, state: ConsumerState) {
        self.state = state;
        metrics::gauge!("sync_consumer_state").set(f64::from(state as u8));
    }

    fn report(&self) {
        info!(
            consumed = self.stats.consumed,
            duplicates_skipped = self.stats.duplicates_skipped,
            forwarded = self.stats.forwarded,
            poison_pills = self.stats.poison_pills,
            errors = self.stats.errors,
            "consumer stats"
        );
    }
}

/// Upstream ids are strings or numbers; anything else does not correlate.
fn correlation_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
