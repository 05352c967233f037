use crate::crypto_backend::SubjectDefaults;
use crate::key_request::DEFAULT_VALIDITY_DAYS;
use crate::lifecycle::BatchPolicy;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "keysmith.toml";

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_key_directory")]
    pub key_directory: PathBuf,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub defaults: GenerationDefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            key_directory: default_key_directory(),
            registry_path: default_registry_path(),
            log_level: default_log_level(),
            defaults: GenerationDefaults::default(),
        }
    }
}

fn default_key_directory() -> PathBuf {
    PathBuf::from("keys")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("keys/registry.txt")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct GenerationDefaults {
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    #[serde(default)]
    pub batch_policy: BatchPolicy,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_country")]
    pub country: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
            batch_policy: BatchPolicy::default(),
            organization: default_organization(),
            country: default_country(),
        }
    }
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

fn default_organization() -> String {
    "Keysmith".to_string()
}

fn default_country() -> String {
    "US".to_string()
}

impl GenerationDefaults {
    pub fn subject(&self) -> SubjectDefaults {
        SubjectDefaults {
            organization: self.organization.clone(),
            country: self.country.clone(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the defaults when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn log_level(&self) -> Result<tracing::Level> {
        self.log_level
            .parse()
            .map_err(|_| anyhow!("Unknown log level '{}'", self.log_level))
    }

    fn validate(&self) -> Result<()> {
        if self.defaults.validity_days == 0 {
            return Err(anyhow!("defaults.validity_days must be positive"));
        }
        if !self.defaults.country.is_empty() && self.defaults.country.len() != 2 {
            return Err(anyhow!("defaults.country must be a 2 letter code"));
        }
        self.log_level()?;
        Ok(())
    }
}
