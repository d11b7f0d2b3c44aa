use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors that can happen while pulling records from an upstream source.
/// All of them are considered transient and are retried by the fetch wrapper.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {error}")]
    RequestError { url: String, error: reqwest::Error },
    #[error("{url} responded with {status}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to decode records returned by {url}: {error}")]
    DecodeError { url: String, error: reqwest::Error },
}

/// Enumeration of errors related to writing records to the broker. Any of them fails the
/// current tick of the task only.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize record for {topic}: {error}")]
    SerializeError {
        topic: String,
        error: serde_json::Error,
    },
    #[error("failed to enqueue message for {topic}: {error}")]
    EnqueueError { topic: String, error: KafkaError },
    #[error("broker rejected message for {topic}: {error}")]
    DeliveryError { topic: String, error: KafkaError },
    #[error("delivery of message for {topic} was cancelled before acknowledgement")]
    DeliveryCancelled { topic: String },
}
