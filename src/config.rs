//! Relay configuration.
//!
//! Loaded from a JSON file, with environment variables supplying hospital
//! tokens so secrets need not live on disk: a variable named `<CODE>_TOKEN`
//! (code uppercased) overrides the static `token` for that hospital.
//!
//! Durations are humantime strings (`"30s"`, `"5m"`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Primary listener address, e.g. `":443"` or `"0.0.0.0:443"`.
    pub listen_addr: String,

    /// Root domain; tunnel ids derive by stripping `.<domain>` from Host.
    pub domain: String,

    /// TLS termination mode.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Static hospital credential set.
    #[serde(default)]
    pub hospitals: Vec<HospitalConfig>,

    /// Session idle cutoff. A tunnel whose last heartbeat is older than this
    /// is considered dead.
    #[serde(default = "default_idle_timeout", with = "duration_format")]
    pub idle_timeout: Duration,

    /// Per-request timeout: bounds time to the response head and the gap
    /// between body frames. Generous by default for large image transfers.
    #[serde(default = "default_request_timeout", with = "duration_format")]
    pub request_timeout: Duration,

    /// Upper bound on concurrently registered tunnels.
    #[serde(default = "default_max_concurrent_conn")]
    pub max_concurrent_conn: usize,

    /// Address for the admin endpoint (`/health`, `/status`). Admin serving
    /// is disabled when absent.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

/// TLS certificate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// When false the relay serves plaintext and assumes an external
    /// terminator (ingress / load balancer) in front.
    #[serde(default)]
    pub enabled: bool,

    /// Static certificate material.
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,

    /// Obtain certificates on demand through ACME instead.
    #[serde(default)]
    pub auto_cert: bool,

    /// Contact email for the ACME account. Required with `auto_cert`.
    #[serde(default)]
    pub acme_email: String,
}

/// One hospital credential: `subdomain` must equal `code + "." + domain`
/// (case-insensitively).
#[derive(Debug, Clone, Deserialize)]
pub struct HospitalConfig {
    pub code: String,
    pub subdomain: String,
    #[serde(default)]
    pub token: String,
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_concurrent_conn() -> usize {
    1000
}

impl Config {
    /// Load from a JSON file, apply env token overrides and validate.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&data)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Replace hospital tokens from `<CODE>_TOKEN` environment variables.
    pub fn apply_env_overrides(&mut self) {
        for hospital in &mut self.hospitals {
            let key = format!("{}_TOKEN", hospital.code.to_uppercase());
            if let Ok(token) = std::env::var(&key) {
                if !token.is_empty() {
                    hospital.token = token;
                }
            }
        }
    }

    /// Startup validation. Everything here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        parse_listen_addr(&self.listen_addr)?;
        if let Some(addr) = &self.metrics_addr {
            parse_listen_addr(addr)?;
        }

        if self.tls.enabled {
            if self.tls.auto_cert {
                if self.tls.acme_email.trim().is_empty() {
                    return Err(ConfigError::MissingAcmeEmail);
                }
            } else if self.tls.cert_file.is_empty() || self.tls.key_file.is_empty() {
                return Err(ConfigError::MissingKeyMaterial);
            }
        }

        for hospital in &self.hospitals {
            let expected = format!("{}.{}", hospital.code, self.domain);
            if !hospital.subdomain.eq_ignore_ascii_case(&expected) {
                return Err(ConfigError::SubdomainMismatch {
                    code: hospital.code.clone(),
                    subdomain: hospital.subdomain.clone(),
                    expected,
                });
            }
        }

        Ok(())
    }

    /// Look up a hospital credential. Case-sensitive on `code`.
    pub fn hospital(&self, code: &str) -> Option<&HospitalConfig> {
        self.hospitals.iter().find(|h| h.code == code)
    }
}

/// Parse a Go-style listen address: `":443"` binds all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddr {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Serde adapter for humantime duration strings.
mod duration_format {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
