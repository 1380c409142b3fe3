use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Order in which the registry is scanned when a released key wakes a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WakeOrder {
    /// Most recently registered connection first.
    #[default]
    Lifo,
    /// Oldest connection first.
    Fifo,
}

/// How a waiter's pending key is compared against the released key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WakeMatch {
    /// Pending key starts with the released key, ASCII case-insensitive.
    #[default]
    Prefix,
    /// Byte-for-byte equality.
    Exact,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Unix domain socket path. Takes precedence over `host`/`port` when set.
    pub socket_path: Option<String>,
    /// Octal access mask applied to the unix socket, e.g. "0700".
    pub socket_access: String,
    /// Maximum number of concurrently open client connections.
    pub max_connections: usize,
    /// Initial read buffer size per connection.
    pub read_buffer_size: usize,
    /// Ceiling the read buffer may grow to while waiting for a full line.
    pub max_read_buffer_size: usize,
    /// Largest reply (including CRLF) a connection will queue.
    pub write_buffer_size: usize,
    pub wake_order: WakeOrder,
    pub wake_match: WakeMatch,
    /// How long shutdown waits for open connections before aborting them.
    pub shutdown_grace_ms: u64,
    /// Log format: "compact" or "json".
    pub log_format: String,
    pub status_enabled: bool,
    pub status_host: String,
    pub status_port: u16,
    pub status_path_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9970,
            socket_path: None,
            socket_access: "0700".to_string(),
            max_connections: 1024,
            read_buffer_size: 2048,
            max_read_buffer_size: 1024 * 1024,
            write_buffer_size: 2048,
            wake_order: WakeOrder::Lifo,
            wake_match: WakeMatch::Prefix,
            shutdown_grace_ms: 10_000,
            log_format: "compact".to_string(),
            status_enabled: false,
            status_host: "127.0.0.1".to_string(),
            status_port: 9971,
            status_path_prefix: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("KEYLOCK"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn unix_socket_path(&self) -> Option<PathBuf> {
        self.socket_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse `socket_access` as an octal permission mask.
    pub fn socket_mode(&self) -> anyhow::Result<u32> {
        let digits = self.socket_access.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        let mode = u32::from_str_radix(digits, 8)
            .with_context(|| format!("invalid socket access mask {:?}", self.socket_access))?;
        if mode > 0o777 {
            anyhow::bail!("socket access mask {:o} is out of range", mode);
        }
        Ok(mode)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.unix_socket_path().is_some() {
            self.socket_mode()?;
        } else if self.port == 0 {
            anyhow::bail!("port must be non-zero when no socket path is configured");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be greater than 0");
        }
        if self.read_buffer_size == 0 || self.write_buffer_size < 3 {
            anyhow::bail!("buffer sizes must leave room for at least one reply byte");
        }
        if self.max_read_buffer_size < self.read_buffer_size {
            anyhow::bail!(
                "max_read_buffer_size ({}) is below read_buffer_size ({})",
                self.max_read_buffer_size,
                self.read_buffer_size
            );
        }
        match self.log_format.as_str() {
            "compact" | "json" => Ok(()),
            other => anyhow::bail!("unknown log format {other:?}"),
        }
    }
}
