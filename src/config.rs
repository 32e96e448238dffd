//! Client configuration.
//!
//! The only thing the RPC core needs from the outside world is where Neovim
//! is listening. Everything else has a sensible default and can be tuned via
//! builder methods or environment variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `NVIM_RPC_ADDR` | endpoint (`host:port` or socket path) |
//! | `NVIM` | endpoint exported by Neovim to its child processes |
//! | `NVIM_LISTEN_ADDRESS` | legacy Neovim endpoint variable |
//! | `NVIM_RPC_TIMEOUT_MS` | per-call timeout in milliseconds |
//! | `NVIM_RPC_SUBSCRIPTION_CAPACITY` | buffered notifications per subscription |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::rpc::MAX_FRAME_SIZE;

/// Default number of notifications buffered per subscription before the
/// dispatcher has to wait for the consumer.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 16;

/// Environment variables consulted for the endpoint, highest priority first.
const ENDPOINT_VARS: [&str; 3] = ["NVIM_RPC_ADDR", "NVIM", "NVIM_LISTEN_ADDRESS"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid endpoint {0:?}: expected host:port or a socket path")]
    InvalidEndpoint(String),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where Neovim is listening (`nvim --listen <addr>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 6666,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `host:port`, `[ipv6]:port`, or a filesystem path.
    ///
    /// Anything containing a path separator is a socket path, as is anything
    /// that does not end in a numeric port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| ConfigError::InvalidEndpoint(s.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if s.contains('/') || s.contains('\\') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse() {
                Ok(port) => Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                }),
                Err(_) => Err(ConfigError::InvalidEndpoint(s.to_string())),
            },
            Some(_) => Err(ConfigError::InvalidEndpoint(s.to_string())),
            None => Ok(Endpoint::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Configuration for a [`Client`](crate::rpc::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Bounded capacity of each subscription channel.
    pub subscription_capacity: usize,
    /// Per-call timeout. `None` waits until the response or disconnect.
    pub call_timeout: Option<Duration>,
    /// Largest incomplete frame the decoder will buffer.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            call_timeout: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    /// Build a configuration from environment variables.
    ///
    /// Resolution order for the endpoint:
    /// 1. `NVIM_RPC_ADDR`
    /// 2. `NVIM` (set by Neovim for processes it spawns)
    /// 3. `NVIM_LISTEN_ADDRESS`
    /// 4. `127.0.0.1:6666`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some((var, addr)) = ENDPOINT_VARS
            .iter()
            .find_map(|var| lookup(var).filter(|v| !v.is_empty()).map(|v| (*var, v)))
        {
            config.endpoint = addr.parse()?;
            info!("Using endpoint from {}: {}", var, config.endpoint);
        }

        if let Some(value) = lookup("NVIM_RPC_TIMEOUT_MS") {
            let ms: u64 = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidVar {
                    var: "NVIM_RPC_TIMEOUT_MS",
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(value) = lookup("NVIM_RPC_SUBSCRIPTION_CAPACITY") {
            let capacity: usize = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidVar {
                    var: "NVIM_RPC_SUBSCRIPTION_CAPACITY",
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.subscription_capacity = capacity;
        }

        Ok(config.normalized())
    }

    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self.normalized()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Bounded channels need room for at least one item.
    fn normalized(mut self) -> Self {
        self.subscription_capacity = self.subscription_capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_parse_tcp_endpoints() {
        assert_eq!(
            "localhost:6666".parse::<Endpoint>(),
            Ok(Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 6666
            })
        );
        assert_eq!(
            "[::1]:7777".parse::<Endpoint>(),
            Ok(Endpoint::Tcp {
                host: "::1".to_string(),
                port: 7777
            })
        );
    }

    #[test]
    fn test_parse_socket_paths() {
        assert_eq!(
            "/run/user/1000/nvim.1234.0".parse::<Endpoint>(),
            Ok(Endpoint::Unix(PathBuf::from("/run/user/1000/nvim.1234.0")))
        );
        assert_eq!(
            "nvim.sock".parse::<Endpoint>(),
            Ok(Endpoint::Unix(PathBuf::from("nvim.sock")))
        );
    }

    #[test]
    fn test_parse_rejects_bad_endpoints() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("localhost:notaport".parse::<Endpoint>().is_err());
        assert!(":6666".parse::<Endpoint>().is_err());
        assert!("[::1]".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrips() {
        for addr in ["127.0.0.1:6666", "[::1]:7777", "/tmp/nvim.sock"] {
            let endpoint: Endpoint = addr.parse().unwrap();
            assert_eq!(endpoint.to_string(), addr);
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.endpoint, Endpoint::default());
        assert_eq!(config.subscription_capacity, DEFAULT_SUBSCRIPTION_CAPACITY);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[test]
    fn test_from_env_endpoint_priority() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("NVIM", "/tmp/nvim-child.sock"),
            ("NVIM_LISTEN_ADDRESS", "127.0.0.1:1"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, Endpoint::Unix("/tmp/nvim-child.sock".into()));

        let config = ClientConfig::from_lookup(lookup_from(&[
            ("NVIM_RPC_ADDR", "localhost:9000"),
            ("NVIM", "/tmp/nvim-child.sock"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint.to_string(), "localhost:9000");
    }

    #[test]
    fn test_from_env_tuning_vars() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("NVIM_RPC_TIMEOUT_MS", "1500"),
            ("NVIM_RPC_SUBSCRIPTION_CAPACITY", "0"),
        ]))
        .unwrap();
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.subscription_capacity, 1);

        let err = ClientConfig::from_lookup(lookup_from(&[("NVIM_RPC_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                var: "NVIM_RPC_TIMEOUT_MS",
                ..
            }
        ));
    }
}
