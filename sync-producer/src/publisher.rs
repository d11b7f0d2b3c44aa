use async_trait::async_trait;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use sync_common::record::{Message, Record};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::error::PublishError;
use crate::kafka_producer::KafkaContext;

/// Writes records to a topic, one message per record.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the number of messages acknowledged by the broker.
    async fn publish(&self, topic: &str, records: Vec<Record>) -> Result<usize, PublishError>;
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }

    fn enqueue(&self, message: &Message) -> Result<DeliveryFuture, PublishError> {
        let payload = message
            .encode_payload()
            .map_err(|error| PublishError::SerializeError {
                topic: message.topic.clone(),
                error,
            })?;

        self.producer
            .send_result(FutureRecord {
                topic: message.topic.as_str(),
                payload: Some(&payload),
                partition: None,
                key: Some(message.key.as_str()),
                timestamp: Some(message.timestamp_millis()),
                headers: None,
            })
            .map_err(|(error, _)| PublishError::EnqueueError {
                topic: message.topic.clone(),
                error,
            })
    }

    async fn process_ack(topic: String, delivery: DeliveryFuture) -> Result<(), PublishError> {
        match delivery.await {
            Err(_) => Err(PublishError::DeliveryCancelled { topic }),
            Ok(Err((error, _))) => Err(PublishError::DeliveryError { topic, error }),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    #[instrument(skip_all, fields(topic = topic, records = records.len()))]
    async fn publish(&self, topic: &str, records: Vec<Record>) -> Result<usize, PublishError> {
        if records.is_empty() {
            debug!("nothing to publish");
            return Ok(0);
        }

        let mut set = JoinSet::new();
        for record in records {
            let message = Message::for_record(topic, record);
            // Enqueue sequentially to keep per-key ordering in the producer queue.
            let ack = self.enqueue(&message)?;
            set.spawn(Self::process_ack(message.topic, ack));
        }

        let mut published = 0;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(())) => published += 1,
                Ok(Err(err)) => {
                    set.abort_all();
                    metrics::counter!("sync_producer_published_total", "topic" => topic.to_owned())
                        .increment(published as u64);
                    return Err(err);
                }
                Err(err) => {
                    set.abort_all();
                    error!("join error while waiting on Kafka ACK: {:?}", err);
                    return Err(PublishError::DeliveryCancelled {
                        topic: topic.to_owned(),
                    });
                }
            }
        }

        metrics::counter!("sync_producer_published_total", "topic" => topic.to_owned())
            .increment(published as u64);
        info!("published {} message(s) to {}", published, topic);

        Ok(published)
    }
}
