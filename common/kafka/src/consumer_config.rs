use rdkafka::ClientConfig;

/// Consumer configuration builder for group consumers that manage their own offsets.
///
/// Auto commit and auto offset store are always disabled: offsets are committed
/// explicitly once every record below them has been handled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Cooperative-sticky assignment keeps partitions in place across rebalances.
    /// With a client id, static membership is enabled as well.
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(client_id) = client_id {
            self.config
                .set("client.id", client_id)
                .set("group.instance.id", client_id);
        }
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_automatic_offsets() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "pipeline").build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("pipeline"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls_and_offset_reset() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "pipeline")
            .with_tls(true)
            .with_offset_reset("latest")
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_sticky_assignment_with_static_membership() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "pipeline")
            .with_sticky_partition_assignment(Some("pod-1"))
            .build();

        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("group.instance.id"), Some("pod-1"));

        let config = ConsumerConfigBuilder::new("kafka:9092", "pipeline")
            .with_sticky_partition_assignment(None)
            .build();
        assert_eq!(config.get("group.instance.id"), None);
    }

    #[test]
    fn test_custom_settings_override_defaults() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "pipeline")
            .set("session.timeout.ms", "10000")
            .with_max_poll_interval_ms(60000)
            .build();

        assert_eq!(config.get("session.timeout.ms"), Some("10000"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("60000"));
    }
}
