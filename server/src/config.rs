use crate::errors::ServerError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

/// A bound listening socket with its HTTP protocol and TLS configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChannelConfig {
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            address: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Protocol selection per channel. HTTP/2 requires TLS (h2 is negotiated
/// via ALPN); HTTP/1.1 runs with or without it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "version")]
pub enum HttpConfig {
    #[serde(rename = "v1_1")]
    V1 {
        #[serde(default)]
        tls: Option<TlsConfig>,
    },
    #[serde(rename = "v2")]
    V2 { tls: TlsConfig },
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig::V1 { tls: None }
    }
}

impl HttpConfig {
    pub fn tls(&self) -> Option<&TlsConfig> {
        match self {
            HttpConfig::V1 { tls } => tls.as_ref(),
            HttpConfig::V2 { tls } => Some(tls),
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self, HttpConfig::V2 { .. })
    }
}

/// TLS material: either a combined PEM file or separate key and chain.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TlsConfig {
    Combined {
        pem: PathBuf,
    },
    Split {
        private_key: PathBuf,
        certificate_chain: PathBuf,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Closes a connection with no request in flight after this long.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: f64,
    /// Closes a connection after this many responses.
    #[serde(default = "default_request_limit")]
    pub request_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout_seconds: default_idle_timeout(),
            request_limit: default_request_limit(),
        }
    }
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_seconds)
    }
}

fn default_idle_timeout() -> f64 {
    4.0
}

fn default_request_limit() -> usize {
    128
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ServerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ServerError::ConfigFile {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| ServerError::ConfigFile {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.channels.is_empty() {
            return Err(ServerError::Config("no channels configured".into()));
        }
        for channel in &self.channels {
            if channel.connection.idle_timeout_seconds <= 0.0 {
                return Err(ServerError::Config(
                    "idle_timeout_seconds must be positive".into(),
                ));
            }
            if channel.connection.request_limit == 0 {
                return Err(ServerError::Config("request_limit must be positive".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
channels:
  - endpoint: { address: 127.0.0.1, port: 8443 }
    http:
      version: v2
      tls:
        pem: combined.pem
    connection:
      idle_timeout_seconds: 2.5
      request_limit: 16
metrics:
  statsd_host: 127.0.0.1
  statsd_port: 8125
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.channels.len(), 1);
        let channel = &config.channels[0];
        assert_eq!(channel.endpoint.port, 8443);
        assert!(channel.http.is_h2());
        assert_eq!(
            channel.http.tls(),
            Some(&TlsConfig::Combined {
                pem: "combined.pem".into()
            })
        );
        assert_eq!(channel.connection.request_limit, 16);
        assert_eq!(
            config.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
            })
        );
    }

    #[test]
    fn test_defaults_apply() {
        let yaml = "channels:\n  - {}\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let channel = &config.channels[0];
        assert_eq!(channel.endpoint, Endpoint::default());
        assert_eq!(channel.http, HttpConfig::V1 { tls: None });
        assert_eq!(channel.connection.idle_timeout_seconds, 4.0);
        assert_eq!(channel.connection.request_limit, 128);
    }

    #[test]
    fn test_v2_without_tls_is_rejected() {
        let yaml = "channels:\n  - http: { version: v2 }\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_split_tls_paths() {
        let yaml = r#"
channels:
  - http:
      version: v1_1
      tls:
        private_key: key.pem
        certificate_chain: chain.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.channels[0].http.tls(),
            Some(&TlsConfig::Split {
                private_key: "key.pem".into(),
                certificate_chain: "chain.pem".into(),
            })
        );
    }

    #[test]
    fn test_from_file_and_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channels:\n  - {{}}").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.channels.len(), 1);

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "channels: []").unwrap();
        assert!(matches!(
            Config::from_file(empty.path()),
            Err(ServerError::Config(_))
        ));

        assert!(matches!(
            Config::from_file("/nonexistent/config.yaml"),
            Err(ServerError::ConfigFile { .. })
        ));
    }
}
