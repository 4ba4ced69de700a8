use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShaleConfig {
    #[serde(default)]
    pub topic: TopicSection,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TopicSection {
    #[serde(default = "defaults::name")]
    pub name: String,
    #[serde(default = "defaults::msg_size")]
    pub msg_size: u32,
    #[serde(default = "defaults::msg_count")]
    pub msg_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn name() -> String {
        "/shale0".into()
    }

    pub fn msg_size() -> u32 {
        256
    }

    pub fn msg_count() -> u32 {
        10
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            name: defaults::name(),
            msg_size: defaults::msg_size(),
            msg_count: defaults::msg_count(),
        }
    }
}

impl Default for ShaleConfig {
    fn default() -> Self {
        Self {
            topic: TopicSection::default(),
            log_level: defaults::log_level(),
        }
    }
}

impl ShaleConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    /// Parses and validates a TOML document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let shale_config: ShaleConfig = toml::from_str(text)?;
        shale_config.validate()?;
        Ok(shale_config)
    }

    /// Rejects values no topic could be created with. Name rules beyond the
    /// leading slash are enforced when the topic is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let topic = &self.topic;
        if !topic.name.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "topic.name '{}' must start with '/'",
                topic.name
            )));
        }
        if topic.msg_size == 0 {
            return Err(ConfigError::Invalid("topic.msg_size must be non-zero".into()));
        }
        if topic.msg_count == 0 {
            return Err(ConfigError::Invalid("topic.msg_count must be non-zero".into()));
        }
        Ok(())
    }
}
