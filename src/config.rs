use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::ClientFlags;

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_RX_BUFFER_SIZE: u16 = 16384;
pub const DEFAULT_TX_SIZE_LIMIT: u16 = u16::MAX;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 150;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u16 = 5000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 40;

/// Error produced when client configuration fails to load or validate.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("host must not be empty")]
    EmptyHost,
    #[error("receive buffer size must be greater than zero")]
    ZeroRxBuffer,
    #[error("poll interval must be at least 1 ms")]
    PollIntervalTooSmall,
}

/// Where to connect and how large the local buffers are.
///
/// The password is never serialized back out.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: String,
    /// Largest frame accepted from the server; also advertised in the handshake.
    pub rx_buffer_size: u16,
    /// Upper bound for outbound frames; lowered to the server's advertised size.
    pub tx_size_limit: u16,
    /// Per-write timeout on the transport.
    pub io_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.rx_buffer_size == 0 {
            return Err(ConfigError::ZeroRxBuffer);
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            password: String::new(),
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            tx_size_limit: DEFAULT_TX_SIZE_LIMIT,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("rx_buffer_size", &self.rx_buffer_size)
            .field("tx_size_limit", &self.tx_size_limit)
            .field("io_timeout_ms", &self.io_timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Per-connection options handed to `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Handshake deadline, and keepalive interval when the server does not
    /// advertise its own idle threshold.
    pub connection_timeout_ms: u16,
    pub flags: ClientFlags,
    /// Username recorded in the server's logs.
    pub username: Option<String>,
    /// Permission mask to narrow what the password grants. `u64::MAX` means unrestricted.
    pub permissions: u64,
    /// Kick power to narrow what the password grants. `u8::MAX` means unrestricted.
    pub kick_power: u8,
    /// How long the worker waits for inbound bytes before re-checking timers.
    pub poll_interval_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            flags: ClientFlags::NONE,
            username: None,
            permissions: u64::MAX,
            kick_power: u8::MAX,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl ConnectOptions {
    pub fn with_flags(mut self, flags: ClientFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_restrictions(mut self, permissions: u64, kick_power: u8) -> Self {
        self.permissions = permissions;
        self.kick_power = kick_power;
        self
    }

    pub fn with_connection_timeout_ms(mut self, timeout_ms: u16) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Validates the options and derives the flag bits that depend on them.
    ///
    /// A blank username is dropped. `SPECIFY_LOG_USERNAME` is set exactly when a
    /// username remains, and `RESTRICT_PERMISSIONS` exactly when permissions or
    /// kick power differ from their unrestricted values.
    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        if self.poll_interval_ms < 1 {
            return Err(ConfigError::PollIntervalTooSmall);
        }
        self.username = self.username.filter(|name| !name.trim().is_empty());
        self.flags
            .set(ClientFlags::SPECIFY_LOG_USERNAME, self.username.is_some());
        self.flags.set(
            ClientFlags::RESTRICT_PERMISSIONS,
            self.permissions != u64::MAX || self.kick_power != u8::MAX,
        );
        Ok(self)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.connection_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_defaults_and_hides_password() {
        let config =
            ClientConfig::from_json_str(r#"{"host":"sl.example.net","password":"pw"}"#).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.rx_buffer_size, 16384);
        assert_eq!(config.tx_size_limit, 65535);
        assert_eq!(config.io_timeout(), Duration::from_millis(150));
        assert_eq!(config.address(), "sl.example.net:7777");

        let out = serde_json::to_string(&config).unwrap();
        assert!(!out.contains("pw"));
        assert!(!format!("{:?}", config).contains("pw"));
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"host":"  "}"#),
            Err(ConfigError::EmptyHost)
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"rx_buffer_size":0}"#),
            Err(ConfigError::ZeroRxBuffer)
        ));
        assert!(matches!(
            ClientConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn normalize_derives_flags() {
        let opts = ConnectOptions::default()
            .with_flags(ClientFlags::SPECIFY_LOG_USERNAME | ClientFlags::RESTRICT_PERMISSIONS)
            .normalize()
            .unwrap();
        assert_eq!(opts.flags, ClientFlags::NONE);

        let opts = ConnectOptions::default()
            .with_username("admin")
            .with_restrictions(u64::MAX, 10)
            .normalize()
            .unwrap();
        assert!(opts.flags.contains(ClientFlags::SPECIFY_LOG_USERNAME));
        assert!(opts.flags.contains(ClientFlags::RESTRICT_PERMISSIONS));
    }

    #[test]
    fn whitespace_username_is_dropped() {
        let opts = ConnectOptions::default()
            .with_username(" \t ")
            .with_flags(ClientFlags::SPECIFY_LOG_USERNAME)
            .normalize()
            .unwrap();
        assert_eq!(opts.username, None);
        assert!(!opts.flags.contains(ClientFlags::SPECIFY_LOG_USERNAME));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = ConnectOptions::default()
            .with_poll_interval_ms(0)
            .normalize()
            .unwrap_err();
        assert!(matches!(err, ConfigError::PollIntervalTooSmall));
    }
}
