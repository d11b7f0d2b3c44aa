pub mod config;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod signal;
