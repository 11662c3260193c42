//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::utility::ceil_log2;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Geometry of a counting array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// Requested slot count; rounded up to a power of two.
    pub size: u64,
    /// Key length in bits.
    pub key_bits: u16,
    /// Primary counter field width in bits.
    pub counter_bits: u8,
    /// Requested reprobe limit; capped at construction to fit the table.
    pub max_reprobe: u16,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        // 21 two-bit symbols, 7-bit counters, quadratic probing capped at 62.
        Self {
            size: 1 << 20,
            key_bits: 42,
            counter_bits: 7,
            max_reprobe: 62,
        }
    }
}

impl ArrayConfig {
    /// Create a config from explicit geometry.
    pub fn new(size: u64, key_bits: u16, counter_bits: u8, max_reprobe: u16) -> Self {
        Self {
            size,
            key_bits,
            counter_bits,
            max_reprobe,
        }
    }

    /// Cheap sanity checks, so config problems surface before allocation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        };
        if self.size < 2 {
            return Err(invalid("array.size", self.size.to_string()));
        }
        if self.key_bits == 0 || (self.key_bits as u32) < ceil_log2(self.size) {
            return Err(invalid("array.key_bits", self.key_bits.to_string()));
        }
        if self.counter_bits == 0 || self.counter_bits > 64 {
            return Err(invalid("array.counter_bits", self.counter_bits.to_string()));
        }
        Ok(())
    }

    fn apply_override(&mut self, env_key: &str, field: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        match field {
            "size" => self.size = parse(env_key, value)?,
            "key_bits" => self.key_bits = parse(env_key, value)?,
            "counter_bits" => self.counter_bits = parse(env_key, value)?,
            "max_reprobe" => self.max_reprobe = parse(env_key, value)?,
            _ => return Err(ConfigError::UnknownKey(env_key.to_string())),
        }
        Ok(())
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OximerConfig {
    /// Counting array geometry.
    #[serde(default)]
    pub array: ArrayConfig,
}

impl OximerConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIMER_CONFIG` env var (if set), then
    /// apply `OXIMER__array__<field>` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("OXIMER_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix("OXIMER__") else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            match parts.as_slice() {
                ["array", field] => self.array.apply_override(&key, field, value.trim())?,
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }
}
