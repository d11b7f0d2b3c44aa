use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{CommitError, ReceiveError};

/// A message as read from a topic, before any decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

/// Read position of one topic-partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Offsets to commit after `batch` was fully handled: one past the last message of every
/// topic-partition in it.
pub fn commit_positions(batch: &[ConsumedMessage]) -> Vec<Position> {
    let mut next: BTreeMap<(&str, i32), i64> = BTreeMap::new();
    for message in batch {
        let entry = next
            .entry((message.topic.as_str(), message.partition))
            .or_insert(message.offset + 1);
        *entry = (*entry).max(message.offset + 1);
    }

    next.into_iter()
        .map(|((topic, partition), offset)| Position {
            topic: topic.to_owned(),
            partition,
            offset,
        })
        .collect()
}

/// Offsets to rewind to so that every message of `batch` is delivered again: the first
/// message of every topic-partition in it.
pub fn rewind_positions(batch: &[ConsumedMessage]) -> Vec<Position> {
    let mut first: BTreeMap<(&str, i32), i64> = BTreeMap::new();
    for message in batch {
        let entry = first
            .entry((message.topic.as_str(), message.partition))
            .or_insert(message.offset);
        *entry = (*entry).min(message.offset);
    }

    first
        .into_iter()
        .map(|((topic, partition), offset)| Position {
            topic: topic.to_owned(),
            partition,
            offset,
        })
        .collect()
}

/// The pull side of the broker, with manual offset management.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait up to `timeout` for the first message, then return what is readily available, up to
    /// `max` messages. An empty batch means the timeout passed.
    async fn next_batch(
        &self,
        max: usize,
        timeout: time::Duration,
    ) -> Result<Vec<ConsumedMessage>, ReceiveError>;

    /// Durably record `positions` as the next offsets to read for their partitions.
    async fn commit(&self, positions: Vec<Position>) -> Result<(), CommitError>;

    /// Move the read cursor back so that reading resumes at `positions`.
    async fn rewind(&self, positions: Vec<Position>) -> Result<(), CommitError>;
}

#[derive(Default)]
struct MemoryLog {
    messages: BTreeMap<String, Vec<ConsumedMessage>>,
    cursors: HashMap<String, i64>,
    committed: HashMap<String, i64>,
}

/// A single-partition-per-topic, single-reader broker kept in memory.
///
/// Cloning gives another handle on the same log, so a test can publish on one handle while a
/// consumer reads from another.
#[derive(Clone, Default)]
pub struct MemorySource {
    log: Arc<Mutex<MemoryLog>>,
    appended: Arc<Notify>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its offset.
    pub fn push(&self, topic: &str, key: Option<&str>, payload: Option<Vec<u8>>) -> i64 {
        let offset = {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            let messages = log.messages.entry(topic.to_owned()).or_default();
            let offset = messages.len() as i64;
            messages.push(ConsumedMessage {
                topic: topic.to_owned(),
                partition: 0,
                offset,
                key: key.map(str::to_owned),
                payload,
            });
            offset
        };

        self.appended.notify_waiters();
        offset
    }

    /// Committed next offset of a topic, if anything was committed yet.
    pub fn committed(&self, topic: &str) -> Option<i64> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.committed.get(topic).copied()
    }

    /// Forget the read cursors, like a consumer restarting after a crash: reading resumes from
    /// the committed offsets.
    pub fn restart(&self) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.cursors = log.committed.clone();
    }

    fn take(&self, max: usize) -> Vec<ConsumedMessage> {
        let mut guard = self.log.lock().unwrap_or_else(|e| e.into_inner());
        let log = &mut *guard;
        let mut batch = Vec::new();

        for (topic, messages) in log.messages.iter() {
            let cursor = log.cursors.entry(topic.clone()).or_insert(0);
            while batch.len() < max && (*cursor as usize) < messages.len() {
                batch.push(messages[*cursor as usize].clone());
                *cursor += 1;
            }
        }

        batch
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_batch(
        &self,
        max: usize,
        timeout: time::Duration,
    ) -> Result<Vec<ConsumedMessage>, ReceiveError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let appended = self.appended.notified();
            let batch = self.take(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = appended => {},
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn commit(&self, positions: Vec<Position>) -> Result<(), CommitError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        for position in positions {
            let committed = log.committed.entry(position.topic).or_insert(0);
            *committed = (*committed).max(position.offset);
        }
        Ok(())
    }

    async fn rewind(&self, positions: Vec<Position>) -> Result<(), CommitError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        for position in positions {
            log.cursors.insert(position.topic, position.offset);
        }
        Ok(())
    }
}
