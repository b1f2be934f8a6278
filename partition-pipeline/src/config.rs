use std::str::FromStr;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;

use crate::backoff::ExponentialBackoff;
use crate::consumer::ConsumerOptions;
use crate::processor::ProcessorConfig;
use crate::queue::QueueKind;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_TOPIC", default = "pings")]
    pub topic: String,

    #[envconfig(from = "KAFKA_REPLY_TOPIC", default = "pings")]
    pub reply_topic: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "partition-pipeline")]
    pub consumer_group: String,

    #[envconfig(from = "KAFKA_OFFSET_RESET", default = "earliest")]
    pub offset_reset: String,

    #[envconfig(default = "100")]
    pub poll_timeout_ms: EnvMsDuration,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub max_pending_records: usize,

    #[envconfig(default = "5000")]
    pub commit_idle_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub drain_timeout_ms: EnvMsDuration,

    #[envconfig(default = "priority")]
    pub queue_kind: QueueKind,

    #[envconfig(default = "5000")]
    pub retry_window_ms: EnvMsDuration,

    #[envconfig(default = "2")]
    pub poll_error_backoff_base: u32,

    #[envconfig(default = "100")]
    pub poll_error_backoff_unit_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub poll_error_backoff_max_ms: EnvMsDuration,

    // Prometheus exporter listen address, no exporter when unset
    pub metrics_bind_address: Option<String>,
}

impl Config {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            queue_kind: self.queue_kind,
            retry_window: self.retry_window_ms.0,
        }
    }

    pub fn poll_error_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.poll_error_backoff_base)
            .with_unit(self.poll_error_backoff_unit_ms.0)
            .with_max(self.poll_error_backoff_max_ms.0)
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            poll_timeout: self.poll_timeout_ms.0,
            max_poll_records: self.max_poll_records,
            max_pending_records: self.max_pending_records,
            commit_idle: self.commit_idle_ms.0,
            drain_timeout: self.drain_timeout_ms.0,
            processor: self.processor_config(),
            poll_error_backoff: self.poll_error_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(config.queue_kind, QueueKind::Priority);
        assert_eq!(config.metrics_bind_address, None);

        let options = config.consumer_options();
        assert_eq!(options.poll_timeout, Duration::from_millis(100));
        assert_eq!(options.commit_idle, Duration::from_secs(5));
        assert_eq!(options.drain_timeout, Duration::from_secs(10));
        assert_eq!(options.max_pending_records, 1000);
        assert_eq!(options.processor.retry_window, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("QUEUE_KIND".to_string(), "eager".to_string()),
            ("COMMIT_IDLE_MS".to_string(), "250".to_string()),
            ("KAFKA_TOPIC".to_string(), "orders".to_string()),
            ("KAFKA_HOSTS".to_string(), "kafka:9092".to_string()),
            ("POLL_ERROR_BACKOFF_BASE".to_string(), "3".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.topic, "orders");
        assert_eq!(config.kafka.kafka_hosts, "kafka:9092");
        assert_eq!(config.processor_config().queue_kind, QueueKind::Eager);
        assert_eq!(config.commit_idle_ms.0, Duration::from_millis(250));
        assert_eq!(config.poll_error_backoff().base(), 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let env = HashMap::from([("QUEUE_KIND".to_string(), "fifo".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());

        let env = HashMap::from([("DRAIN_TIMEOUT_MS".to_string(), "soon".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_env_ms_duration() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(Duration::from_millis(1500)))
        );
        assert_eq!("-1".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }
}
