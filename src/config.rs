use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::DEFAULT_POLL_INTERVAL;
use crate::aria2::{DEFAULT_PORT, EngineSettings};
use crate::error::FetchError;
use crate::locate::Layout;
use crate::resolver::DEFAULT_MARKER_SUFFIX;
use crate::store::DEFAULT_SNAPSHOT_NAME;
use crate::template::{DEFAULT_URL_TEMPLATE, UrlTemplate};

pub const DEFAULT_CONFIG_FILE: &str = "clim-fetch.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub verify_checksum: Option<bool>,
    #[serde(default)]
    pub marker_suffix: Option<String>,
    #[serde(default)]
    pub layout: Option<Layout>,
    #[serde(default)]
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub engine: EngineEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EngineEntry {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub max_connections: Option<u16>,
    #[serde(default)]
    pub split: Option<u16>,
    #[serde(default)]
    pub allow_overwrite: Option<bool>,
    #[serde(default)]
    pub auto_file_renaming: Option<bool>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub rpc_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub url_template: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub verify_checksum: bool,
    pub marker_suffix: String,
    pub layout: Layout,
    pub snapshot_name: String,
    pub engine: EngineSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `clim-fetch.json` from the working directory when it
    /// exists. No file at all means defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, FetchError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FetchError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FetchError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, FetchError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(FetchError::ConfigParse(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }

        let url_template = config
            .url_template
            .unwrap_or_else(|| DEFAULT_URL_TEMPLATE.to_string());
        UrlTemplate::parse(&url_template)?;

        let poll_interval = config
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(FetchError::ConfigParse(
                "poll_interval_secs must be positive".to_string(),
            ));
        }

        let defaults = EngineSettings::default();
        let entry = config.engine;
        let engine = EngineSettings {
            binary: entry.binary.unwrap_or(defaults.binary),
            max_connections: entry.max_connections.unwrap_or(defaults.max_connections),
            split: entry.split.unwrap_or(defaults.split),
            allow_overwrite: entry.allow_overwrite.unwrap_or(defaults.allow_overwrite),
            auto_file_renaming: entry
                .auto_file_renaming
                .unwrap_or(defaults.auto_file_renaming),
            secret: entry.secret.filter(|secret| !secret.trim().is_empty()),
            startup_timeout: entry
                .startup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
            rpc_timeout: entry
                .rpc_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.rpc_timeout),
        };

        Ok(ResolvedConfig {
            schema_version,
            url_template,
            port: config.port.unwrap_or(DEFAULT_PORT),
            poll_interval,
            verify_checksum: config.verify_checksum.unwrap_or(false),
            marker_suffix: config
                .marker_suffix
                .unwrap_or_else(|| DEFAULT_MARKER_SUFFIX.to_string()),
            layout: config.layout.unwrap_or_default(),
            snapshot_name: config
                .snapshot_name
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_NAME.to_string()),
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.port, 6800);
        assert_eq!(resolved.poll_interval, Duration::from_secs(5));
        assert_eq!(resolved.marker_suffix, ".aria2");
        assert_eq!(resolved.layout, Layout::Flat);
        assert_eq!(resolved.url_template, DEFAULT_URL_TEMPLATE);
        assert_eq!(resolved.engine.max_connections, 16);
    }
}
