use std::sync::Arc;
use std::time;

use sync_common::retry::RetryPolicy;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::PublishError;
use crate::fetcher::{fetch_with_retry, SourceFetcher};
use crate::publisher::Publisher;

/// A source registered with the scheduler: where to fetch from, where to publish to, how often.
pub struct ProducerTask {
    pub fetcher: Box<dyn SourceFetcher>,
    pub topic: String,
    pub interval: time::Duration,
}

impl ProducerTask {
    pub fn new(fetcher: Box<dyn SourceFetcher>, topic: &str, interval: time::Duration) -> Self {
        Self {
            fetcher,
            topic: topic.to_owned(),
            interval,
        }
    }

    pub fn source(&self) -> &str {
        self.fetcher.name()
    }
}

/// Runs every registered task on its own timer.
///
/// Tasks share nothing but the publisher. A tick that fails, or panics, is logged and ends that
/// tick only. A task never overlaps itself: when a tick outlives its interval the missed ticks
/// are skipped rather than queued up.
pub struct ProducerScheduler {
    tasks: Vec<Arc<ProducerTask>>,
    publisher: Arc<dyn Publisher>,
    retry_policy: RetryPolicy,
}

impl ProducerScheduler {
    pub fn new(
        tasks: Vec<ProducerTask>,
        publisher: Arc<dyn Publisher>,
        retry_policy: RetryPolicy,
    ) -> Self {
        info!("producer scheduler registered {} task(s)", tasks.len());

        Self {
            tasks: tasks.into_iter().map(Arc::new).collect(),
            publisher,
            retry_policy,
        }
    }

    /// Run until `shutdown` is cancelled. An in-flight tick is abandoned on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut set = JoinSet::new();

        for task in self.tasks {
            set.spawn(run_task(
                task,
                self.publisher.clone(),
                self.retry_policy,
                shutdown.clone(),
            ));
        }

        while let Some(res) = set.join_next().await {
            if let Err(err) = res {
                error!("producer task exited unexpectedly: {}", err);
            }
        }

        info!("producer scheduler stopped");
    }
}

async fn run_task(
    task: Arc<ProducerTask>,
    publisher: Arc<dyn Publisher>,
    retry_policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(task.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut tick = tokio::spawn({
            let task = task.clone();
            let publisher = publisher.clone();
            async move { run_tick(&task, publisher.as_ref(), &retry_policy).await }
        });

        tokio::select! {
            res = &mut tick => {
                if let Err(err) = res {
                    error!(source = task.source(), "producer tick panicked: {}", err);
                    metrics::counter!(
                        "sync_producer_tick_panics_total",
                        "source" => task.source().to_owned()
                    )
                    .increment(1);
                }
            }
            _ = shutdown.cancelled() => {
                tick.abort();
                break;
            }
        }
    }

    info!(source = task.source(), "producer task stopped");
}

/// One fetch-then-publish round for `task`, returning the number of published messages.
pub async fn run_tick(
    task: &ProducerTask,
    publisher: &dyn Publisher,
    retry_policy: &RetryPolicy,
) -> Result<usize, PublishError> {
    let start = tokio::time::Instant::now();
    let labels = [("source", task.source().to_owned())];

    let records = fetch_with_retry(task.fetcher.as_ref(), retry_policy).await;

    let result = if records.is_empty() {
        debug!(source = task.source(), "no records to publish");
        Ok(0)
    } else {
        publisher.publish(&task.topic, records).await
    };

    metrics::histogram!("sync_producer_tick_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(published) => {
            debug!(
                source = task.source(),
                topic = %task.topic,
                published,
                "producer tick finished"
            );
            Ok(published)
        }
        Err(err) => {
            error!(
                source = task.source(),
                topic = %task.topic,
                "failed to publish records: {}",
                err
            );
            metrics::counter!("sync_producer_publish_errors_total", "topic" => task.topic.clone())
                .increment(1);
            Err(err)
        }
    }
}
