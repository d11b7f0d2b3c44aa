pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod kafka_consumer;
pub mod merge;
pub mod sink;
pub mod source;

#[cfg(test)]
mod test_utils;
