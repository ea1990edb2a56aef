pub mod app_config;
pub mod client_config;
#[cfg(test)]
pub mod test_config;

pub use app_config::AppConfig;
pub use client_config::{ConsumerConfig, OffsetReset, ProducerConfig, IDEMPOTENT_PROPERTIES};
