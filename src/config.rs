use std::path::Path;

use serde::Deserialize;

use crate::error::AppResult;

/// Config file checked when no explicit path is given.
const DEFAULT_CONFIG_FILE: &str = "armonite.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 4222,
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub dsn: String,
    /// Connection-pool knobs kept for config compatibility; the embedded
    /// SQLite store serialises access through one connection.
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dsn: "armonite.db".to_owned(),
            max_open: 10,
            max_idle: 5,
            max_lifetime: "1h".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub concurrency: u32,
    pub duration: String,
    pub keep_alive: bool,
    pub min_agents: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            duration: "1m".to_owned(),
            keep_alive: true,
            min_agents: 1,
        }
    }
}

/// Loads configuration: an explicit path must exist and parse; otherwise
/// `armonite.toml` is used when present, and built-in defaults when not.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Config> {
    let path = match path {
        Some(path) => path.to_owned(),
        None => {
            if !Path::new(DEFAULT_CONFIG_FILE).exists() {
                return Ok(Config::default());
            }
            DEFAULT_CONFIG_FILE.to_owned()
        }
    };

    let raw = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 4222);
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.defaults.min_agents, 1);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            http_port = 9090

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.server.port, 4222);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.persistence.dsn, "armonite.db");
    }
}
