use std::str::FromStr;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

/// Group id carried by anonymous consumers. librdkafka wants one even when
/// partitions are assigned manually; nothing is ever committed against it.
pub const ANONYMOUS_GROUP_ID: &str = "kafka-poller-anonymous";

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_client_id: Option<String>,

    // earliest, latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Extra librdkafka settings, e.g. "fetch.max.bytes=1048576,client.rack=a"
    pub kafka_consumer_properties: Option<ConsumerProperties>,
}

/// Comma separated `key=value` pairs handed to librdkafka untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerProperties(pub Vec<(String, String)>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseConsumerPropertiesError(pub String);

impl std::fmt::Display for ParseConsumerPropertiesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid consumer property {:?}, expected key=value", self.0)
    }
}

impl std::error::Error for ParseConsumerPropertiesError {}

impl FromStr for ConsumerProperties {
    type Err = ParseConsumerPropertiesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut properties = Vec::new();
        for pair in s.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ParseConsumerPropertiesError(pair.to_owned()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParseConsumerPropertiesError(pair.to_owned()));
            }
            properties.push((key.to_owned(), value.trim().to_owned()));
        }
        Ok(ConsumerProperties(properties))
    }
}

/// Kafka consumer configuration builder.
///
/// - `for_group_consumer`: subscribes through a consumer group; offsets are
///   committed manually, never automatically.
/// - `for_anonymous_consumer`: assign-only consumer that never joins a group.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn for_anonymous_consumer(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", ANONYMOUS_GROUP_ID)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Starts from the shared settings in `kafka`, picking the consumer kind
    /// from whether a group id is present.
    pub fn from_kafka_config(kafka: &KafkaConfig, group_id: Option<&str>) -> Self {
        let builder = match group_id {
            Some(group_id) => Self::for_group_consumer(&kafka.kafka_hosts, group_id)
                .with_offset_reset(&kafka.kafka_consumer_offset_reset),
            None => Self::for_anonymous_consumer(&kafka.kafka_hosts)
                .with_offset_reset(&kafka.kafka_consumer_offset_reset),
        };

        let builder = builder
            .with_tls(kafka.kafka_tls)
            .with_client_id(kafka.kafka_client_id.as_deref());

        match &kafka.kafka_consumer_properties {
            Some(properties) => builder.with_properties(properties),
            None => builder,
        }
    }

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

    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        if let Some(client_id) = client_id {
            self.config.set("client.id", client_id);
        }
        self
    }

    /// Applied last, so explicit properties override the defaults above.
    pub fn with_properties(mut self, properties: &ConsumerProperties) -> Self {
        for (key, value) in &properties.0 {
            self.config.set(key, value);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: "kafka:9092".to_string(),
            kafka_tls: false,
            kafka_client_id: None,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_properties: None,
        }
    }

    #[test]
    fn test_parse_consumer_properties() {
        let properties: ConsumerProperties = "fetch.max.bytes=1048576, client.rack = a,"
            .parse()
            .unwrap();

        assert_eq!(
            properties.0,
            vec![
                ("fetch.max.bytes".to_string(), "1048576".to_string()),
                ("client.rack".to_string(), "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_consumer_properties_rejects_missing_value_separator() {
        let result = "fetch.max.bytes".parse::<ConsumerProperties>();
        assert_eq!(
            result,
            Err(ParseConsumerPropertiesError("fetch.max.bytes".to_string()))
        );
        assert!("=value".parse::<ConsumerProperties>().is_err());
    }

    #[test]
    fn test_group_consumer_disables_auto_commit() {
        let config = ConsumerConfigBuilder::from_kafka_config(&kafka_config(), Some("workers")).build();

        assert_eq!(config.get("group.id"), Some("workers"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_anonymous_consumer_uses_placeholder_group() {
        let config = ConsumerConfigBuilder::from_kafka_config(&kafka_config(), None).build();

        assert_eq!(config.get("group.id"), Some(ANONYMOUS_GROUP_ID));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("session.timeout.ms"), None);
    }

    #[test]
    fn test_explicit_properties_override_defaults() {
        let mut kafka = kafka_config();
        kafka.kafka_tls = true;
        kafka.kafka_client_id = Some("poller-1".to_string());
        kafka.kafka_consumer_properties = Some("session.timeout.ms=45000".parse().unwrap());

        let config = ConsumerConfigBuilder::from_kafka_config(&kafka, Some("workers")).build();

        assert_eq!(config.get("session.timeout.ms"), Some("45000"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("client.id"), Some("poller-1"));
    }
}
