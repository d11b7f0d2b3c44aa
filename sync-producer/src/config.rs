use envconfig::Envconfig;
use sync_common::config::{EnvMsDuration, KafkaConfig, NonEmptyString, RetryPolicyConfig};

use crate::fetcher::RestFetcher;
use crate::scheduler::ProducerTask;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    pub crm_base_url: NonEmptyString,

    pub inventory_base_url: NonEmptyString,

    #[envconfig(default = "customer_data")]
    pub customer_topic: NonEmptyString,

    #[envconfig(default = "inventory_data")]
    pub inventory_topic: NonEmptyString,

    /// Default cadence for every source.
    #[envconfig(default = "360")]
    pub poll_interval: EnvMsDuration,

    pub crm_poll_interval: Option<EnvMsDuration>,

    pub inventory_poll_interval: Option<EnvMsDuration>,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The fixed registry of sources polled by this producer.
    pub fn producer_tasks(&self, client: &reqwest::Client) -> Vec<ProducerTask> {
        vec![
            ProducerTask::new(
                Box::new(RestFetcher::customers(
                    self.crm_base_url.as_str(),
                    client.clone(),
                )),
                self.customer_topic.as_str(),
                self.crm_poll_interval.unwrap_or(self.poll_interval).0,
            ),
            ProducerTask::new(
                Box::new(RestFetcher::inventory(
                    self.inventory_base_url.as_str(),
                    client.clone(),
                )),
                self.inventory_topic.as_str(),
                self.inventory_poll_interval.unwrap_or(self.poll_interval).0,
            ),
        ]
    }
}
