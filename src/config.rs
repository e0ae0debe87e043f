use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified otherwise)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the loader.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Loader configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrent download workers.
    pub max_threads: usize,

    /// Timeout for establishing a connection to an origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for completing a request against an origin.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Extra request headers sent with every download, merged over the
    /// default `Accept` header.
    pub headers: BTreeMap<String, String>,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_threads: 10,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            headers: BTreeMap::new(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn get(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open configuration file {}", path.display()))?;
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_yaml::from_reader(reader).context("failed to parse configuration YAML")
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(de::Error::custom)
}
