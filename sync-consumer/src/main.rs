use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;

use sync_common::{metrics, signal};
use sync_consumer::config::Config;
use sync_consumer::consumer::MergeConsumer;
use sync_consumer::dedup::RedisDedupStore;
use sync_consumer::kafka_consumer::KafkaMessageSource;
use sync_consumer::sink::HttpSink;

#[tokio::main]
async fn main() -> Result<()> {
    signal::init_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let source = KafkaMessageSource::new(
        &config.kafka,
        config.kafka_consumer_group.as_str(),
        &config.kafka_consumer_offset_reset,
        &[config.customer_topic.as_str(), config.inventory_topic.as_str()],
    )
    .wrap_err("failed to create kafka consumer")?;

    let store = RedisDedupStore::new(
        config.redis_url.as_str(),
        config.dedup_lease.0,
        config.dedup_retention.0,
        config.redis_timeout.0,
    )
    .await
    .wrap_err("failed to connect to the dedup store")?;

    let sink = HttpSink::new(
        config.sink_base_url.as_str(),
        &config.sink_endpoint,
        config.sink_timeout.0,
        config.sink_retry_policy(),
    )
    .wrap_err("failed to build sink client")?;
    tracing::info!("forwarding merged documents to {}", sink.url());

    let consumer = MergeConsumer::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(sink),
        config.customer_topic.as_str(),
        config.inventory_topic.as_str(),
    )
    .with_batch_size(config.batch_size)
    .with_poll_timeout(config.poll_timeout.0)
    .with_backoff(config.retry_policy.policy())
    .with_stats_interval(config.stats_interval.0);

    let recorder_handle = metrics::setup_metrics_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let router = metrics::app("sync-consumer", Some(recorder_handle));
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(router, &bind).await {
            tracing::error!("failed to start sync-consumer http server, {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown().await;
            shutdown.cancel();
        }
    });

    consumer.run(shutdown).await;

    Ok(())
}
