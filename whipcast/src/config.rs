use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use whipcast_sfu::RelayConfig;

/// Prefix of environment overrides, e.g. `WHIPCAST_SERVER__PORT=9000`
const ENV_PREFIX: &str = "WHIPCAST";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served for paths no API route matches
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `config_file`, then environment
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::build(config_file, Environment::with_prefix(ENV_PREFIX))
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    fn build(config_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }

        // Nested keys use a double underscore: WHIPCAST_RELAY__GATHER_TIMEOUT_MS
        builder = builder.add_source(
            env.prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("relay.ice_servers")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if let Some(dir) = &self.server.static_dir {
            if !dir.is_dir() {
                errors.push(format!(
                    "server.static_dir {} is not a directory",
                    dir.display()
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }

        if let Err(relay_errors) = self.relay.validate() {
            errors.extend(relay_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP server address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::build(None, env(&[])).unwrap();

        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.relay.codec.mime_type, "video/H264");
        assert_eq!(config.relay.codec.payload_type, 96);
        assert_eq!(config.relay.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = yaml_file(
            "server:\n  host: 127.0.0.1\n  port: 9000\n\
             relay:\n  gather_timeout_ms: 2500\n  ice_servers: []\n",
        );

        let config = Config::build(file.path().to_str(), env(&[])).unwrap();

        assert_eq!(config.http_address(), "127.0.0.1:9000");
        assert_eq!(config.relay.gather_timeout_ms, 2500);
        assert!(config.relay.ice_servers.is_empty());
        // Untouched sections keep their defaults
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.relay.pli_interval_ms, 3000);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = yaml_file("server:\n  port: 9000\n");

        let config = Config::build(
            file.path().to_str(),
            env(&[
                ("WHIPCAST_SERVER__PORT", "9100"),
                ("WHIPCAST_LOGGING__FORMAT", "json"),
                (
                    "WHIPCAST_RELAY__ICE_SERVERS",
                    "stun:a.example.com:3478,stun:b.example.com:3478",
                ),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.relay.ice_servers,
            vec!["stun:a.example.com:3478", "stun:b.example.com:3478"]
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::build(Some("/nonexistent/whipcast.yaml"), env(&[])).is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.logging.level = "loud".to_string();
        config.relay.codec.payload_type = 8;
        config.server.static_dir = Some(PathBuf::from("/nonexistent/static"));

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
    }
}
