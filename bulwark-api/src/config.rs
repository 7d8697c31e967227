//! YAML server configuration.
//!
//! ```yaml
//! address: 0.0.0.0:7373
//! admin:
//!   identity: 15a5cc1a...   # SPKI SHA-256 digest; omit to disable the bypass
//! tls:
//!   key: ./server.key
//!   cert: ./server.cert
//!   proxy:
//!     identities: [41c287...]
//!     header:
//!       cert: X-Tls-Client-Cert
//! policy:
//!   read-only:
//!     allow: ["/v1/key/generate/*", "/v1/key/decrypt/*"]
//!     deny: ["/v1/key/decrypt/internal-*"]
//!     identities: [df72c6...]
//! cache:
//!   expiry:
//!     any: 5m
//!     unused: 30s
//!     offline: 0s
//! log:
//!   error: on
//!   audit: off
//! keys:
//!   - name: app-key
//! keystore:
//!   fs:
//!     path: ./keys
//! ```

use bulwark_keystore::CacheExpiry;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::Parse(msg) => write!(f, "cannot parse config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    #[serde(default)]
    pub admin: AdminConfig,
    pub tls: TlsConfig,
    #[serde(default)]
    pub policy: HashMap<String, PolicyConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    pub keystore: KeystoreConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    pub identity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub password: Option<String>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub header: ProxyHeaderConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyHeaderConfig {
    #[serde(default = "default_cert_header")]
    pub cert: String,
}

impl Default for ProxyHeaderConfig {
    fn default() -> Self {
        Self {
            cert: default_cert_header(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub identities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub expiry: ExpiryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiryConfig {
    #[serde(default = "default_any", deserialize_with = "duration")]
    pub any: Duration,
    #[serde(default = "default_unused", deserialize_with = "duration")]
    pub unused: Duration,
    #[serde(default, deserialize_with = "duration")]
    pub offline: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            any: default_any(),
            unused: default_unused(),
            offline: Duration::ZERO,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "switch_on", deserialize_with = "switch")]
    pub error: bool,
    #[serde(default = "switch_on", deserialize_with = "switch")]
    pub audit: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            error: true,
            audit: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoreConfig {
    pub memory: Option<MemoryBackendConfig>,
    pub fs: Option<FsBackendConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryBackendConfig {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsBackendConfig {
    pub path: PathBuf,
}

fn default_address() -> SocketAddr {
    "0.0.0.0:7373".parse().expect("valid default address")
}

fn default_cert_header() -> String {
    "X-Tls-Client-Cert".into()
}

fn default_any() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_unused() -> Duration {
    Duration::from_secs(30)
}

fn switch_on() -> bool {
    true
}

/// Durations are humantime strings: `5m`, `30s`, `0s`.
fn duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// `on` / `off`.
fn switch<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let s = String::deserialize(d)?;
    match s.as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected 'on' or 'off', got '{}'",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let backends = self.keystore.memory.is_some() as u8 + self.keystore.fs.is_some() as u8;
        if backends != 1 {
            return Err(ConfigError::Invalid(
                "exactly one backend must be configured under 'keystore'".into(),
            ));
        }
        if self.cache.expiry.any.is_zero() || self.cache.expiry.unused.is_zero() {
            return Err(ConfigError::Invalid(
                "cache.expiry.any and cache.expiry.unused must be positive".into(),
            ));
        }
        if self.tls.password.is_some() {
            return Err(ConfigError::Invalid(
                "encrypted TLS private keys are not supported; provide an unencrypted key".into(),
            ));
        }
        for name in self.policy.keys() {
            if !bulwark_keystore::valid_name(name) {
                return Err(ConfigError::Invalid(format!("invalid policy name: {}", name)));
            }
        }
        for key in &self.keys {
            if !bulwark_keystore::valid_name(&key.name) {
                return Err(ConfigError::Invalid(format!("invalid key name: {}", key.name)));
            }
        }
        Ok(())
    }

    pub fn cache_expiry(&self) -> CacheExpiry {
        CacheExpiry {
            any: self.cache.expiry.any,
            unused: self.cache.expiry.unused,
            offline: self.cache.expiry.offline,
        }
    }
}
