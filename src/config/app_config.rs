use crate::application::error::{ApplicationError, Result};
use crate::config::client_config::{ConsumerConfig, ProducerConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Settings for the demo pipeline: seed an input topic, then copy it to the output
/// topic exactly once, one transaction per polled batch.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub input_topic: String,
    pub output_topic: String,
    pub partitions: i32,
    pub seed_records: usize,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_topic: "kkafka-input".to_string(),
            output_topic: "kkafka-output".to_string(),
            partitions: 3,
            seed_records: 100,
            consumer: ConsumerConfig::new("kkafka-demo")
                .with_max_poll_records(25)
                .with_poll_timeout(Duration::from_millis(200)),
            producer: ProducerConfig::transactional("kkafka-demo"),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `KKAFKA_INPUT_TOPIC`, `KKAFKA_OUTPUT_TOPIC`,
    /// `KKAFKA_PARTITIONS`, `KKAFKA_SEED_RECORDS`, `KKAFKA_GROUP_ID` and
    /// `KKAFKA_MAX_POLL_RECORDS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(topic) = env::var("KKAFKA_INPUT_TOPIC") {
            config.input_topic = topic;
        }
        if let Ok(topic) = env::var("KKAFKA_OUTPUT_TOPIC") {
            config.output_topic = topic;
        }
        if let Some(partitions) = parse_var("KKAFKA_PARTITIONS")? {
            config.partitions = partitions;
        }
        if let Some(seed_records) = parse_var("KKAFKA_SEED_RECORDS")? {
            config.seed_records = seed_records;
        }
        if let Ok(group_id) = env::var("KKAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Some(max) = parse_var("KKAFKA_MAX_POLL_RECORDS")? {
            config.consumer.max_poll_records = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_topic == self.output_topic {
            return Err(ApplicationError::Config(
                "input and output topics must differ".to_string(),
            ));
        }
        if self.partitions < 1 {
            return Err(ApplicationError::Config(format!(
                "partitions must be positive, got {}",
                self.partitions
            )));
        }
        if self.consumer.max_poll_records == 0 {
            return Err(ApplicationError::Config(
                "max poll records must be positive".to_string(),
            ));
        }
        if self.producer.transactional_id.is_none() {
            return Err(ApplicationError::Config(
                "the demo producer needs a transactional id".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApplicationError::Config(format!("{} is not valid: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
