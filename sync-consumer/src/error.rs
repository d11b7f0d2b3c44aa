use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors that can happen while handing a document to the sink.
/// A forward error keeps the batch uncommitted so its messages are delivered again.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("request to {url} failed: {error}")]
    RequestError { url: String, error: reqwest::Error },
    #[error("{url} responded with {status}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Enumeration of errors raised by a dedup store. The consumer never forwards without a
/// successful claim, so all of them block consumption until the store answers again.
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("timed out waiting for the dedup store")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("kafka error: {0}")]
    KafkaError(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("kafka error: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("offset task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// Reasons a batch ended without its offsets being committed.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to receive messages: {0}")]
    ReceiveError(#[from] ReceiveError),
    #[error("{failed} of {total} forward(s) failed")]
    ForwardFailed { failed: usize, total: usize },
    #[error("failed to move offsets: {0}")]
    CommitError(#[from] CommitError),
    #[error("shutdown requested while waiting on the dedup store")]
    Interrupted,
}
