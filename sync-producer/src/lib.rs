pub mod config;
pub mod error;
pub mod fetcher;
pub mod kafka_producer;
pub mod publisher;
pub mod scheduler;

#[cfg(test)]
mod test_utils;
