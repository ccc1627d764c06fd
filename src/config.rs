//! Configuration management for Ratewarden.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `RATEWARDEN_*` environment variables. Nested keys are separated by `__`
//! in variable names, e.g. `RATEWARDEN_LIMITS__ADDRESS_LIMITING=false`.
//!
//! Per-credential overrides can additionally be given one variable each:
//!
//! ```text
//! RATEWARDEN_CREDENTIAL_LIMIT_<credential>=<max_requests>:<window_secs>
//! ```

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::ratelimit::Policy;

/// Environment variable prefix for all settings.
const ENV_PREFIX: &str = "RATEWARDEN";
/// Environment variable prefix for per-credential overrides.
const CREDENTIAL_LIMIT_PREFIX: &str = "RATEWARDEN_CREDENTIAL_LIMIT_";

/// Main configuration for the Ratewarden engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local memory; counters are not shared between instances
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "ratewarden:".to_string()
}

/// How admission is decided against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionProtocol {
    /// Read the counter, then increment it if admitted. Concurrent requests
    /// can overshoot the limit by up to the number racing on one key.
    #[default]
    CheckThenRecord,
    /// A single conditional increment in the store; never overshoots.
    Atomic,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Policy for addresses and for credentials without an override
    #[serde(default = "default_policy")]
    pub default_policy: Policy,

    /// Policies for specific credentials
    #[serde(default)]
    pub credential_overrides: HashMap<String, Policy>,

    /// Whether requests are limited by address
    #[serde(default = "default_enabled")]
    pub address_limiting: bool,

    /// Whether requests carrying a credential are limited by credential
    #[serde(default = "default_enabled")]
    pub credential_limiting: bool,

    /// Admission protocol
    #[serde(default)]
    pub protocol: AdmissionProtocol,

    /// Upper bound for each decision's store calls, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
            credential_overrides: HashMap::new(),
            address_limiting: default_enabled(),
            credential_limiting: default_enabled(),
            protocol: AdmissionProtocol::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_policy() -> Policy {
    Policy::default()
}

fn default_enabled() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    500
}

impl LimitsConfig {
    /// Check settings that are not already enforced by their types.
    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(Error::Config(
                "store_timeout_ms must be a positive number of milliseconds".to_string(),
            ));
        }
        if self.credential_overrides.keys().any(|credential| credential.is_empty()) {
            return Err(Error::Config(
                "credential overrides must not use an empty credential".to_string(),
            ));
        }
        Ok(())
    }

    /// The store timeout as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl RatewardenConfig {
    /// Load layered configuration from defaults, an optional YAML file, and
    /// the process environment.
    ///
    /// # Errors
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if any
    /// layer is malformed.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut file_overrides = HashMap::new();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            let contents = std::fs::read_to_string(path)?;
            file_overrides = file_credential_overrides(&contents)?;
            builder = builder.add_source(File::from_str(&contents, FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        let mut config: RatewardenConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;

        // map keys come back lowercased from the layered sources
        config.limits.credential_overrides = file_overrides;
        let overrides = credential_overrides_from_env(std::env::vars())?;
        config.limits.credential_overrides.extend(overrides);
        config.limits.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment layering.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        config.limits.validate()?;
        Ok(config)
    }
}

/// The `limits.credential_overrides` section of a YAML document, with
/// credential keys exactly as written.
fn file_credential_overrides(yaml: &str) -> Result<HashMap<String, Policy>> {
    #[derive(Deserialize, Default)]
    struct OverridesDocument {
        #[serde(default)]
        limits: OverridesSection,
    }

    #[derive(Deserialize, Default)]
    struct OverridesSection {
        #[serde(default)]
        credential_overrides: HashMap<String, Policy>,
    }

    let document: Option<OverridesDocument> = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
    Ok(document.unwrap_or_default().limits.credential_overrides)
}

/// Collect `RATEWARDEN_CREDENTIAL_LIMIT_<credential>=<max>:<secs>` pairs.
///
/// A variable with the prefix but a malformed value is an error.
pub fn credential_overrides_from_env<I>(vars: I) -> Result<HashMap<String, Policy>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut overrides = HashMap::new();
    for (name, value) in vars {
        let Some(credential) = name.strip_prefix(CREDENTIAL_LIMIT_PREFIX) else {
            continue;
        };
        if credential.is_empty() {
            return Err(Error::Config(format!("{} names no credential", name)));
        }
        let policy = value
            .parse::<Policy>()
            .map_err(|e| Error::Config(format!("{}: {}", name, e)))?;
        overrides.insert(credential.to_string(), policy);
    }
    Ok(overrides)
}
