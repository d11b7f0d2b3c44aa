use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use serde_json::Value;

use crate::dedup::{Claim, DedupStore, Lease, MemoryDedupStore};
use crate::error::{DedupError, ForwardError};
use crate::fingerprint::Fingerprint;
use crate::sink::Sink;

/// Keeps every accepted document. Rejects the first `failures` forwards with a 503.
#[derive(Default)]
pub struct RecordingSink {
    documents: Mutex<Vec<Value>>,
    failures: AtomicU32,
    delay: time::Duration,
}

impl RecordingSink {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    /// Takes `delay` to accept each document.
    pub fn slow(delay: time::Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn documents(&self) -> Vec<Value> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn forward(&self, document: &Value) -> Result<(), ForwardError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failing {
            return Err(ForwardError::UnexpectedStatus {
                url: "http://sink.test/data".to_owned(),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            });
        }

        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }
}

/// In-memory store whose first `failures` claims time out.
pub struct FlakyStore {
    inner: MemoryDedupStore,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryDedupStore::new(
                time::Duration::from_secs(30),
                time::Duration::from_secs(24 * 60 * 60),
            ),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failed_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst).min(self.failures)
    }
}

#[async_trait]
impl DedupStore for FlakyStore {
    async fn check_and_mark(&self, fingerprint: &Fingerprint) -> Result<Claim, DedupError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(DedupError::Timeout);
        }

        self.inner.check_and_mark(fingerprint).await
    }

    async fn renew(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<bool, DedupError> {
        self.inner.renew(fingerprint, lease).await
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        lease: &Lease,
    ) -> Result<bool, DedupError> {
        self.inner.confirm(fingerprint, lease).await
    }

    async fn release(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<(), DedupError> {
        self.inner.release(fingerprint, lease).await
    }

    fn lease_duration(&self) -> time::Duration {
        self.inner.lease_duration()
    }
}

/// In-memory store where another reader takes over every claim before it can be renewed.
pub struct ContestedStore {
    inner: MemoryDedupStore,
}

impl ContestedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryDedupStore::new(
                time::Duration::from_secs(30),
                time::Duration::from_secs(24 * 60 * 60),
            ),
        }
    }
}

#[async_trait]
impl DedupStore for ContestedStore {
    async fn check_and_mark(&self, fingerprint: &Fingerprint) -> Result<Claim, DedupError> {
        self.inner.check_and_mark(fingerprint).await
    }

    async fn renew(&self, _: &Fingerprint, _: &Lease) -> Result<bool, DedupError> {
        Ok(false)
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        lease: &Lease,
    ) -> Result<bool, DedupError> {
        self.inner.confirm(fingerprint, lease).await
    }

    async fn release(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<(), DedupError> {
        self.inner.release(fingerprint, lease).await
    }

    fn lease_duration(&self) -> time::Duration {
        self.inner.lease_duration()
    }
}
