//! Configuration loading and validation for the keyring service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use common::KeyError;
use serde::Deserialize;
use tracing::warn;
use zeroize::Zeroizing;

use crate::crypto::master::{MasterSecretProvider, MIN_SECRET_LEN};
use crate::manager::ManagerSettings;

/// Deployment environment in which the development master secret is allowed.
pub const DEVELOPMENT_ENV: &str = "development";

/// Fallback master secret, honoured only when `DEPLOYMENT_ENV=development`.
const DEV_MASTER_SECRET: &str = "keyring-development-only-master-secret";

/// Validated keyring service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Root secret the master key is derived from. **Required** outside
    /// development.
    #[serde(default)]
    pub master_secret: Option<String>,

    /// Deployment environment name (`production`, `staging`, `development`).
    #[serde(default = "default_deployment_env")]
    pub deployment_env: String,

    /// Directory holding the JSON key records.
    #[serde(default = "default_key_store_dir")]
    pub key_store_dir: String,

    /// How often (seconds) the expiry sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Lifetime (days) given to a rotated key whose predecessor had no
    /// remaining lifetime.
    #[serde(default = "default_rotation_days")]
    pub default_rotation_days: i64,

    /// Deadline (milliseconds) applied to every store call.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// OTLP endpoint for traces and metrics. Telemetry export is disabled
    /// when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_deployment_env() -> String {
    "production".into()
}
fn default_key_store_dir() -> String {
    "keys".into()
}
fn default_sweep_interval() -> u64 {
    3600
}
fn default_rotation_days() -> i64 {
    90
}
fn default_store_timeout() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    pub fn is_development(&self) -> bool {
        self.deployment_env == DEVELOPMENT_ENV
    }

    /// Manager tuning derived from this configuration.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            default_rotation_days: self.default_rotation_days,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        match self.master_secret.as_deref().map(str::trim) {
            Some(s) if s.len() >= MIN_SECRET_LEN => {}
            Some(s) if !s.is_empty() => {
                anyhow::bail!("MASTER_SECRET must be at least {MIN_SECRET_LEN} bytes")
            }
            _ if self.is_development() => {}
            _ => anyhow::bail!("MASTER_SECRET is required outside development"),
        }

        ensure_non_empty(&self.key_store_dir, "KEY_STORE_DIR")?;

        if self.sweep_interval_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be > 0");
        }
        if self.default_rotation_days <= 0 {
            anyhow::bail!("DEFAULT_ROTATION_DAYS must be > 0");
        }
        if self.store_timeout_ms == 0 {
            anyhow::bail!("STORE_TIMEOUT_MS must be > 0");
        }
        Ok(())
    }
}

impl MasterSecretProvider for Config {
    fn master_secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        match self.master_secret.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Ok(Zeroizing::new(s.as_bytes().to_vec())),
            _ if self.is_development() => {
                warn!("MASTER_SECRET unset; using the development master secret");
                Ok(Zeroizing::new(DEV_MASTER_SECRET.as_bytes().to_vec()))
            }
            _ => Err(KeyError::Configuration(
                "MASTER_SECRET is required outside development".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("master_secret", &self.master_secret.as_ref().map(|_| "[REDACTED]"))
            .field("deployment_env", &self.deployment_env)
            .field("key_store_dir", &self.key_store_dir)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("default_rotation_days", &self.default_rotation_days)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
