//! Runtime configuration, loadable from TOML

use crate::core::error::{Result, WireFsError};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_read_retries() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

/// Tunables of the page cache
///
/// ```toml
/// read_retries = 8
/// sequential_reads = true
/// renegotiate_speed = true
/// verify_bitmap = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireFsConfig {
    /// Raw read attempts on rewritable media before a CRC failure is final
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Pass the sequential-read hint when pages are read in order
    #[serde(default = "default_true")]
    pub sequential_reads: bool,

    /// Renegotiate bus speed when a flush moves to another device
    #[serde(default = "default_true")]
    pub renegotiate_speed: bool,

    /// Read back the device usage bitmap after programming it
    #[serde(default = "default_true")]
    pub verify_bitmap: bool,
}

impl Default for WireFsConfig {
    fn default() -> Self {
        WireFsConfig {
            read_retries: default_read_retries(),
            sequential_reads: true,
            renegotiate_speed: true,
            verify_bitmap: true,
        }
    }
}

impl WireFsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: WireFsConfig =
            toml::from_str(text).map_err(|e| WireFsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WireFsError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the cache cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.read_retries == 0 {
            return Err(WireFsError::InvalidConfig(
                "read_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
