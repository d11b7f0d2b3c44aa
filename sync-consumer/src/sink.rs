use std::time;

use async_trait::async_trait;
use serde_json::Value;
use sync_common::retry::RetryPolicy;
use tracing::{debug, error};

use crate::error::ForwardError;

/// Downstream receiver of merged documents. Accepting a document is the side effect that
/// gates offset commits.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn forward(&self, document: &Value) -> Result<(), ForwardError>;
}

/// `POST <base-url><endpoint>` with the document as JSON body. Any 2xx is an accept.
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl HttpSink {
    pub fn new(
        base_url: &str,
        endpoint: &str,
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("sync-consumer")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ),
            client,
            retry_policy,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, document: &Value) -> Result<(), ForwardError> {
        let response = self
            .client
            .post(&self.url)
            .json(document)
            .send()
            .await
            .map_err(|error| ForwardError::RequestError {
                url: self.url.clone(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::UnexpectedStatus {
                url: self.url.clone(),
                status,
            });
        }

        debug!(url = %self.url, status = status.as_u16(), "sink accepted document");
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn forward(&self, document: &Value) -> Result<(), ForwardError> {
        self.retry_policy
            .retry("sink", |_| self.send(document))
            .await
            .map_err(|err| {
                error!(
                    attempts = self.retry_policy.max_attempts(),
                    "failed to forward document: {}",
                    err
                );
                err
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use serde_json::json;

    fn fast_retries() -> RetryPolicy {
        RetryPolicy::new(3, 2, time::Duration::from_millis(10), None)
    }

    #[tokio::test]
    async fn posts_document_to_data_endpoint() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/data")
                .header("content-type", "application/json")
                .json_body(json!({"key": "1", "partial": true}));
            then.status(202);
        });

        let sink = HttpSink::new(
            &server.base_url(),
            "/data",
            time::Duration::from_secs(5),
            fast_retries(),
        )
        .unwrap();

        sink.forward(&json!({"key": "1", "partial": true}))
            .await
            .expect("forward failed");
        mock.assert();
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/data");
            then.status(500);
        });

        let sink = HttpSink::new(
            &format!("{}/", server.base_url()),
            "data",
            time::Duration::from_secs(5),
            fast_retries(),
        )
        .unwrap();

        match sink.forward(&json!({"key": "1"})).await {
            Err(ForwardError::UnexpectedStatus { status, .. }) => {
                assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        mock.assert_hits(3);
    }

    #[tokio::test]
    async fn unreachable_sink_is_a_request_error() {
        let sink = HttpSink::new(
            "http://127.0.0.1:1",
            "/data",
            time::Duration::from_secs(1),
            RetryPolicy::new(1, 2, time::Duration::from_millis(10), None),
        )
        .unwrap();

        assert!(matches!(
            sink.forward(&json!({"key": "1"})).await,
            Err(ForwardError::RequestError { .. })
        ));
    }
}
