//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::diagnostics::{MergePolicy, SchedulerConfig};
use crate::error::ConfigError;
use crate::rpc::transport::{Channel, Framing};

/// Upper bound for `diagnostics.debounce_ms`.
pub const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Channel and framing.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Diagnostics scheduling.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Reference words providers.
    #[serde(default)]
    pub words: WordsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.mode != TransportMode::Stdio && self.transport.port == 0 {
            return Err(ConfigError::ValidationError {
                message: "transport.port must be non-zero for TCP modes".to_string(),
            });
        }
        if self.diagnostics.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "diagnostics.debounce_ms must be at most {MAX_DEBOUNCE_MS}, got {}",
                    self.diagnostics.debounce_ms
                ),
            });
        }
        if self.words.min_word_length == 0 {
            return Err(ConfigError::ValidationError {
                message: "words.min_word_length must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// How the server talks to its client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    #[default]
    Stdio,
    TcpListen,
    TcpConnect,
}

/// Wire framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    #[default]
    Header,
    LengthPrefixed,
}

impl From<FramingMode> for Framing {
    fn from(mode: FramingMode) -> Self {
        match mode {
            FramingMode::Header => Self::Header,
            FramingMode::LengthPrefixed => Self::LengthPrefixed,
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// `stdio`, `tcp-listen` or `tcp-connect`.
    #[serde(default)]
    pub mode: TransportMode,

    /// Host for the TCP modes.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port for the TCP modes.
    #[serde(default = "default_port")]
    pub port: u16,

    /// `header` (Content-Length) or `length-prefixed`.
    #[serde(default)]
    pub framing: FramingMode,
}

impl TransportConfig {
    /// The channel this configuration selects.
    #[must_use]
    pub fn channel(&self) -> Channel {
        let addr = SocketAddr::new(self.host, self.port);
        match self.mode {
            TransportMode::Stdio => Channel::Stdio,
            TransportMode::TcpListen => Channel::TcpListen(addr),
            TransportMode::TcpConnect => Channel::TcpConnect(addr),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            host: default_host(),
            port: default_port(),
            framing: FramingMode::default(),
        }
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    6601
}

/// Diagnostics scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosticsConfig {
    /// Quiet period after the last edit, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Liveness timeout per provider call in milliseconds; 0 disables it.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// `concatenate` or `first-non-empty`.
    #[serde(default)]
    pub merge: MergePolicy,
}

impl DiagnosticsConfig {
    /// Converts into scheduler settings.
    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            provider_timeout: (self.provider_timeout_ms > 0)
                .then(|| Duration::from_millis(self.provider_timeout_ms)),
            merge: self.merge,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            merge: MergePolicy::default(),
        }
    }
}

const fn default_debounce_ms() -> u64 {
    200
}

const fn default_provider_timeout_ms() -> u64 {
    30_000
}

/// Reference provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WordsConfig {
    /// Words shorter than this are reported.
    #[serde(default = "default_min_word_length")]
    pub min_word_length: usize,
}

impl Default for WordsConfig {
    fn default() -> Self {
        Self {
            min_word_length: default_min_word_length(),
        }
    }
}

const fn default_min_word_length() -> usize {
    3
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
