use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use rdkafka::producer::Producer;
use tokio_util::sync::CancellationToken;

use sync_common::{metrics, signal};
use sync_producer::config::Config;
use sync_producer::fetcher::build_client;
use sync_producer::kafka_producer::create_kafka_producer;
use sync_producer::publisher::KafkaPublisher;
use sync_producer::scheduler::ProducerScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    signal::init_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let producer =
        create_kafka_producer(&config.kafka).wrap_err("failed to create kafka producer")?;
    let client = build_client(config.request_timeout.0).wrap_err("failed to build http client")?;

    let scheduler = ProducerScheduler::new(
        config.producer_tasks(&client),
        Arc::new(KafkaPublisher::new(producer.clone())),
        config.retry_policy.policy(),
    );

    let recorder_handle = metrics::setup_metrics_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let router = metrics::app("sync-producer", Some(recorder_handle));
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(router, &bind).await {
            tracing::error!("failed to start sync-producer http server, {}", e);
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

    scheduler.run(shutdown).await;

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        tracing::warn!("failed to flush kafka producer on shutdown: {}", e);
    }

    Ok(())
}
