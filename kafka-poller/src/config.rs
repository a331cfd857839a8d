use std::str::FromStr;
use std::time;

use common_kafka::config::{ConsumerConfigBuilder, KafkaConfig};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::backpressure::Thresholds;
use crate::poller::PollerSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Unset means anonymous mode: every partition assigned, nothing committed
    pub kafka_consumer_group: Option<String>,

    pub kafka_consumer_topics: TopicList,

    #[envconfig(default = "10")]
    pub poll_interval_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub kafka_operation_timeout_ms: EnvMsDuration,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "8388608")]
    pub max_command_frame_bytes: usize,

    #[envconfig(nested = true)]
    pub backpressure: BackpressureConfig,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get metrics listener bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::from_kafka_config(&self.kafka, self.consumer_group()).build()
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            topics: self.kafka_consumer_topics.0.clone(),
            group_id: self.consumer_group().map(str::to_owned),
            poll_timeout: self.poll_interval_ms.0,
            commit_interval: self.commit_interval_ms.0,
            thresholds: self.backpressure.thresholds(),
        }
    }

    /// An empty group id counts as unset.
    fn consumer_group(&self) -> Option<&str> {
        self.kafka_consumer_group
            .as_deref()
            .filter(|group| !group.is_empty())
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackpressureConfig {
    #[envconfig(default = "2")]
    pub backpressure_pause_min_messages: usize,

    #[envconfig(default = "1000000")]
    pub backpressure_pause_bytes: usize,

    #[envconfig(default = "1000")]
    pub backpressure_pause_messages: usize,

    #[envconfig(default = "500000")]
    pub backpressure_resume_bytes: usize,

    #[envconfig(default = "500")]
    pub backpressure_resume_messages: usize,
}

impl BackpressureConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            pause_min_messages: self.backpressure_pause_min_messages,
            pause_bytes: self.backpressure_pause_bytes,
            pause_messages: self.backpressure_pause_messages,
            resume_bytes: self.backpressure_resume_bytes,
            resume_messages: self.backpressure_resume_messages,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated, non-empty list of topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct TopicListIsEmptyError;

impl FromStr for TopicList {
    type Err = TopicListIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            Err(TopicListIsEmptyError)
        } else {
            Ok(TopicList(topics))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[("KAFKA_CONSUMER_TOPICS", "events")])).unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(!config.export_prometheus);
        assert_eq!(config.max_poll_records, 500);
        assert_eq!(config.max_command_frame_bytes, 8 * 1024 * 1024);

        let settings = config.poller_settings();
        assert_eq!(settings.topics, vec!["events".to_string()]);
        assert_eq!(settings.group_id, None);
        assert_eq!(settings.poll_timeout, time::Duration::from_millis(10));
        assert_eq!(settings.commit_interval, time::Duration::from_secs(5));
        assert_eq!(settings.thresholds, Thresholds::default());
    }

    #[test]
    fn test_topics_are_required() {
        assert!(Config::init_from_hashmap(&env(&[])).is_err());
        assert!(Config::init_from_hashmap(&env(&[("KAFKA_CONSUMER_TOPICS", " , ")])).is_err());
    }

    #[test]
    fn test_group_and_overrides() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_CONSUMER_TOPICS", "events, clicks"),
            ("KAFKA_CONSUMER_GROUP", "exporter"),
            ("COMMIT_INTERVAL_MS", "250"),
            ("BACKPRESSURE_PAUSE_MESSAGES", "50"),
            ("BACKPRESSURE_RESUME_MESSAGES", "10"),
        ]))
        .unwrap();

        let settings = config.poller_settings();
        assert_eq!(settings.topics, vec!["events".to_string(), "clicks".to_string()]);
        assert_eq!(settings.group_id.as_deref(), Some("exporter"));
        assert_eq!(settings.commit_interval, time::Duration::from_millis(250));
        assert_eq!(settings.thresholds.pause_messages, 50);
        assert_eq!(settings.thresholds.resume_messages, 10);
        assert_eq!(settings.thresholds.pause_bytes, 1_000_000);

        let client = config.client_config();
        assert_eq!(client.get("group.id"), Some("exporter"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_empty_group_selects_anonymous_mode() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_CONSUMER_TOPICS", "events"),
            ("KAFKA_CONSUMER_GROUP", ""),
        ]))
        .unwrap();

        assert_eq!(config.poller_settings().group_id, None);
        assert_eq!(
            config.client_config().get("group.id"),
            Some(common_kafka::config::ANONYMOUS_GROUP_ID)
        );
    }

    #[test]
    fn test_invalid_duration() {
        assert_eq!(
            "ten".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
