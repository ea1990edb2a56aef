use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Properties that make a producer idempotent: retries never reorder or duplicate
/// records within a partition.
pub const IDEMPOTENT_PROPERTIES: [(&str, &str); 2] = [
    ("message.send.max.retries", "10000000"),
    ("enable.idempotence", "true"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub client_id: String,
    pub poll_timeout: Duration,     // how long one poll blocks when nothing is available
    pub enable_auto_commit: bool,   // commit the previous poll's positions on every poll
    pub max_poll_records: usize,
    pub auto_offset_reset: OffsetReset,
    pub properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "kkafka".to_string(),
            client_id: format!("kkafka-consumer-{}", Uuid::new_v4()),
            poll_timeout: Duration::from_millis(100),
            enable_auto_commit: false,
            max_poll_records: 500,
            auto_offset_reset: OffsetReset::Earliest,
            properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.enable_auto_commit = enabled;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max;
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client_id: String,
    pub transactional_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: format!("kkafka-producer-{}", Uuid::new_v4()),
            transactional_id: None,
            properties: HashMap::new(),
        }
    }
}

impl ProducerConfig {
    pub fn idempotent() -> Self {
        let mut config = Self::default();
        for (key, value) in IDEMPOTENT_PROPERTIES {
            config.properties.insert(key.to_string(), value.to_string());
        }
        config
    }

    /// An idempotent producer with a fresh transactional id starting with `prefix`.
    pub fn transactional(prefix: &str) -> Self {
        Self::idempotent().with_transactional_id(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn with_transactional_id(mut self, transactional_id: impl Into<String>) -> Self {
        self.transactional_id = Some(transactional_id.into());
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.properties
            .get("enable.idempotence")
            .map_or(false, |v| v == "true")
    }
}
