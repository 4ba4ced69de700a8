mod config;

pub use config::{ConfigError, ShaleConfig, TopicSection};
