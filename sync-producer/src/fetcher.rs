use std::time;

use async_trait::async_trait;
use reqwest::header;
use sync_common::record::Record;
use sync_common::retry::RetryPolicy;
use tracing::{debug, error};

use crate::error::FetchError;

/// An upstream data source polled by the scheduler.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Source tag, used in logs and metrics and stamped on every fetched record.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<Record>, FetchError>;
}

/// Fetch a JSON array of records with `GET <base-url>/<collection>`.
pub struct RestFetcher {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl RestFetcher {
    pub fn new(name: &str, base_url: &str, collection: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.to_owned(),
            url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                collection.trim_start_matches('/')
            ),
            client,
        }
    }

    /// CRM customers, served under `/customers`.
    pub fn customers(base_url: &str, client: reqwest::Client) -> Self {
        Self::new("crm", base_url, "customers", client)
    }

    /// Inventory products, served under `/products`.
    pub fn inventory(base_url: &str, client: reqwest::Client) -> Self {
        Self::new("inventory", base_url, "products", client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SourceFetcher for RestFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        debug!(source = %self.name, url = %self.url, "fetching records");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|error| FetchError::RequestError {
                url: self.url.clone(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus {
                url: self.url.clone(),
                status,
            });
        }

        let records: Vec<Record> =
            response
                .json()
                .await
                .map_err(|error| FetchError::DecodeError {
                    url: self.url.clone(),
                    error,
                })?;

        Ok(records
            .into_iter()
            .map(|record| record.with_source(&self.name))
            .collect())
    }
}

/// Build the HTTP client shared by every REST source.
pub fn build_client(request_timeout: time::Duration) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("sync-producer")
        .timeout(request_timeout)
        .build()
}

/// Fetch from `fetcher` under `retry_policy`. Once every attempt failed the error is logged and
/// swallowed: an unavailable source yields no records instead of failing the caller.
pub async fn fetch_with_retry(
    fetcher: &dyn SourceFetcher,
    retry_policy: &RetryPolicy,
) -> Vec<Record> {
    let source = fetcher.name().to_owned();

    let result = retry_policy
        .retry(&source, |_| {
            let source = source.clone();
            async move {
                metrics::counter!("sync_producer_fetch_attempts_total", "source" => source.clone())
                    .increment(1);
                let result = fetcher.fetch().await;
                if result.is_err() {
                    metrics::counter!("sync_producer_fetch_failures_total", "source" => source)
                        .increment(1);
                }
                result
            }
        })
        .await;

    match result {
        Ok(records) => records,
        Err(err) => {
            error!(
                source = %source,
                attempts = retry_policy.max_attempts(),
                "failed to fetch records after retries: {}",
                err
            );
            metrics::counter!("sync_producer_fetch_exhausted_total", "source" => source)
                .increment(1);
            Vec::new()
        }
    }
}
