use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AttendanceError, Result};

pub const DEFAULT_PORT: u16 = 65432;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Port for the read-only HTTP status routes, disabled when unset
    pub http_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub snapshot_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub send_timeout: Duration,
    pub max_frame_bytes: usize,
    pub duplicate_login: DuplicateLoginPolicy,
}

/// What happens when an identity logs in while a prior connection for it is live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateLoginPolicy {
    /// Close the prior channel and register the new one
    Replace,
    /// Refuse the new login and drop the new connection
    Reject,
}

impl FromStr for DuplicateLoginPolicy {
    type Err = AttendanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(AttendanceError::InvalidConfiguration(format!(
                "DUPLICATE_LOGIN must be replace or reject, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            duplicate_login: DuplicateLoginPolicy::Replace,
        }
    }
}

impl Config {
    /// Creates configuration from `.env` and the process environment
    ///
    /// Optional environment variables:
    /// - `SERVER_HOST` (default: 0.0.0.0), `SERVER_PORT` (default: 65432)
    /// - `HTTP_PORT`: enables the HTTP status routes
    /// - `SNAPSHOT_PATH` (default: data.json)
    /// - `ATTENDANCE_LOG_PATH` (default: attendance_log.json)
    /// - `SEND_TIMEOUT_MS` (default: 2000)
    /// - `MAX_FRAME_BYTES` (default: 65536)
    /// - `DUPLICATE_LOGIN`: replace or reject (default: replace)
    /// - `LOG_FORMAT`: pretty or json (default: pretty)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let http_port = match env::var("HTTP_PORT") {
            Ok(value) if !value.is_empty() => Some(parse_value("HTTP_PORT", &value)?),
            _ => None,
        };

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env("SERVER_PORT", DEFAULT_PORT)?,
                http_port,
            },
            store: StoreConfig {
                snapshot_path: env::var("SNAPSHOT_PATH")
                    .unwrap_or_else(|_| "data.json".to_string())
                    .into(),
                log_path: env::var("ATTENDANCE_LOG_PATH")
                    .unwrap_or_else(|_| "attendance_log.json".to_string())
                    .into(),
            },
            session: SessionConfig {
                send_timeout: Duration::from_millis(parse_env(
                    "SEND_TIMEOUT_MS",
                    DEFAULT_SEND_TIMEOUT_MS,
                )?),
                max_frame_bytes: parse_env("MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?,
                duplicate_login: env::var("DUPLICATE_LOGIN")
                    .unwrap_or_else(|_| "replace".to_string())
                    .parse()?,
            },
            log_format: match env::var("LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.parse_host_to_ipv4()), self.server.port)
    }

    pub fn http_address(&self) -> Option<SocketAddr> {
        self.server
            .http_port
            .map(|port| SocketAddr::new(IpAddr::V4(self.parse_host_to_ipv4()), port))
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        // Try to parse as IP address first
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => parse_value(key, &value),
        _ => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AttendanceError::ConfigurationParseFailed {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_host(host: &str, port: u16) -> Config {
        Config {
            server: ServerConfig {
                host: host.to_string(),
                port,
                http_port: None,
            },
            store: StoreConfig {
                snapshot_path: "data.json".into(),
                log_path: "attendance_log.json".into(),
            },
            session: SessionConfig::default(),
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn test_parse_localhost() {
        let addr = config_with_host("localhost", 8080).bind_address();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_ipv4_address() {
        let addr = config_with_host("192.168.1.1", 3000).bind_address();
        assert_eq!(addr, "192.168.1.1:3000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_empty_host() {
        let addr = config_with_host("", DEFAULT_PORT).bind_address();
        assert_eq!(addr, "0.0.0.0:65432".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_invalid_hostname_defaults_to_all() {
        let addr = config_with_host("invalid-hostname", 9000).bind_address();
        assert_eq!(addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_http_address_follows_host() {
        let mut config = config_with_host("localhost", 9000);
        assert!(config.http_address().is_none());

        config.server.http_port = Some(9001);
        assert_eq!(config.http_address(), Some("127.0.0.1:9001".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn test_duplicate_login_policy_parsing() {
        assert_eq!("replace".parse::<DuplicateLoginPolicy>().unwrap(), DuplicateLoginPolicy::Replace);
        assert_eq!("REJECT".parse::<DuplicateLoginPolicy>().unwrap(), DuplicateLoginPolicy::Reject);
        assert!("overwrite".parse::<DuplicateLoginPolicy>().is_err());
    }

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<u16>("SERVER_PORT", "seventy").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to parse configuration SERVER_PORT: seventy"
        );
    }
}
