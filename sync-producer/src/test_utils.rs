use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sync_common::record::{Message, Record};

use crate::error::{FetchError, PublishError};
use crate::fetcher::SourceFetcher;
use crate::publisher::Publisher;

/// Fails the first `failures` calls with a 503, then returns `records` forever.
pub struct FlakyFetcher {
    name: String,
    failures: u32,
    records: Vec<serde_json::Value>,
    calls: Arc<AtomicU32>,
}

impl FlakyFetcher {
    pub fn new(name: &str, failures: u32, records: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.to_owned(),
            failures,
            records,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl SourceFetcher for FlakyFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(FetchError::UnexpectedStatus {
                url: format!("http://{}.test/", self.name),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            });
        }

        Ok(self
            .records
            .iter()
            .map(|raw| {
                serde_json::from_value::<Record>(raw.clone())
                    .expect("invalid test record")
                    .with_source(&self.name)
            })
            .collect())
    }
}

pub struct PanickingFetcher {
    name: String,
}

impl PanickingFetcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl SourceFetcher for PanickingFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        panic!("{} exploded", self.name)
    }
}

/// Keeps every message it was asked to publish.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn keys(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.key.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, records: Vec<Record>) -> Result<usize, PublishError> {
        let mut messages = self.messages.lock().unwrap();
        let count = records.len();
        messages.extend(
            records
                .into_iter()
                .map(|record| Message::for_record(topic, record)),
        );
        Ok(count)
    }
}

pub struct FailingPublisher;

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, topic: &str, _: Vec<Record>) -> Result<usize, PublishError> {
        Err(PublishError::DeliveryCancelled {
            topic: topic.to_owned(),
        })
    }
}
