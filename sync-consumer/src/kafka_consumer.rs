use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use sync_common::config::KafkaConfig;
use tracing::{debug, info, warn};

use crate::error::{CommitError, ReceiveError};
use crate::source::{ConsumedMessage, MessageSource, Position};

const SEEK_TIMEOUT: time::Duration = time::Duration::from_secs(5);
/// How long to keep filling a batch once its first message arrived.
const BATCH_LINGER: time::Duration = time::Duration::from_millis(50);

/// Group consumer over the record topics. Offsets are only ever stored and committed by the
/// caller: neither auto-commit nor auto-store is enabled.
#[derive(Clone)]
pub struct KafkaMessageSource {
    consumer: Arc<StreamConsumer>,
}

impl KafkaMessageSource {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        offset_reset: &str,
        topics: &[&str],
    ) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", group_id)
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", "300000");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(topics)?;
        info!("subscribed to topics {:?}", topics);

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    fn partition_list(positions: &[Position]) -> Result<TopicPartitionList, KafkaError> {
        let mut list = TopicPartitionList::new();
        for position in positions {
            list.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
            )?;
        }
        Ok(list)
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn next_batch(
        &self,
        max: usize,
        timeout: time::Duration,
    ) -> Result<Vec<ConsumedMessage>, ReceiveError> {
        let mut deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(err)) if batch.is_empty() => return Err(err.into()),
                Ok(Err(err)) => {
                    // Hand over what we have, the error will show up again on the next call.
                    warn!(
                        batched = batch.len(),
                        "kafka error while filling a batch: {}",
                        err
                    );
                    break;
                }
                Ok(Ok(message)) => message,
            };

            if batch.is_empty() {
                deadline = deadline.min(tokio::time::Instant::now() + BATCH_LINGER);
            }

            batch.push(ConsumedMessage {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec),
            });
        }

        Ok(batch)
    }

    async fn commit(&self, positions: Vec<Position>) -> Result<(), CommitError> {
        let list = Self::partition_list(&positions)?;
        let consumer = self.consumer.clone();

        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync)).await??;
        Ok(())
    }

    async fn rewind(&self, positions: Vec<Position>) -> Result<(), CommitError> {
        let consumer = self.consumer.clone();

        tokio::task::spawn_blocking(move || {
            for position in positions {
                consumer.seek(
                    &position.topic,
                    position.partition,
                    Offset::Offset(position.offset),
                    SEEK_TIMEOUT,
                )?;
            }
            Ok::<_, KafkaError>(())
        })
        .await??;
        Ok(())
    }
}
