use envconfig::Envconfig;
use sync_common::config::{
    EnvMsDuration, EnvSecsDuration, KafkaConfig, NonEmptyString, RetryPolicyConfig,
};
use sync_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "sync-consumer")]
    pub kafka_consumer_group: NonEmptyString,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "customer_data")]
    pub customer_topic: NonEmptyString,

    #[envconfig(default = "inventory_data")]
    pub inventory_topic: NonEmptyString,

    pub redis_url: NonEmptyString,

    #[envconfig(default = "1000")]
    pub redis_timeout: EnvMsDuration,

    /// How long a forwarded fingerprint is remembered.
    #[envconfig(default = "86400")]
    pub dedup_retention: EnvSecsDuration,

    /// How long a claim may stay unconfirmed before another reader can take it over.
    #[envconfig(default = "30000")]
    pub dedup_lease: EnvMsDuration,

    pub sink_base_url: NonEmptyString,

    #[envconfig(default = "/data")]
    pub sink_endpoint: String,

    #[envconfig(default = "10000")]
    pub sink_timeout: EnvMsDuration,

    #[envconfig(default = "3")]
    pub sink_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub sink_initial_interval: EnvMsDuration,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(default = "60")]
    pub stats_interval: EnvSecsDuration,

    /// Backoff between failed batches and between dedup store retries.
    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sink_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.sink_max_attempts,
            2,
            self.sink_initial_interval.0,
            None,
        )
    }
}
