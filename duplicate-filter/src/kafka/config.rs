use rdkafka::ClientConfig;

/// Kafka consumer configuration builder.
///
/// `for_consumer` sets the group-consumer defaults this service relies on:
/// offsets are neither stored nor committed automatically, they are committed
/// explicitly from the offset tracker.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// A consumer that only observes a topic and lets rdkafka commit for it
    pub fn for_observer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("socket.timeout.ms", "10000");

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

    /// Where to start when the group has no committed offset: earliest or latest
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Interval of the statistics callback that drives liveness
    pub fn with_statistics_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("statistics.interval.ms", ms.to_string());
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
    fn test_consumer_disables_automatic_offsets() {
        let config = ConsumerConfigBuilder::for_consumer("localhost:9092", "group")
            .with_offset_reset("earliest")
            .build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("group"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_tls_is_opt_in() {
        let plain = ConsumerConfigBuilder::for_observer("localhost:9092", "g")
            .with_tls(false)
            .build();
        assert_eq!(plain.get("security.protocol"), None);

        let tls = ConsumerConfigBuilder::for_observer("localhost:9092", "g")
            .with_tls(true)
            .build();
        assert_eq!(tls.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_custom_settings_override_defaults() {
        let config = ConsumerConfigBuilder::for_consumer("localhost:9092", "group")
            .set("session.timeout.ms", "10000")
            .with_statistics_interval_ms(5000)
            .build();

        assert_eq!(config.get("session.timeout.ms"), Some("10000"));
        assert_eq!(config.get("statistics.interval.ms"), Some("5000"));
    }
}
