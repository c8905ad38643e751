use core::str::FromStr;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::clock::{DEFAULT_SANITY_EPOCH_SECS, from_unix_secs};

/// Flat file holding the fixed-width record
pub const FLAT_FILE_NAME: &str = "watermeter.dat";
/// Image of the paged key-value store
pub const PAGED_KV_FILE_NAME: &str = "watermeter.db";
/// Structured text record
pub const JSON_FILE_NAME: &str = "watermeter.json";
/// Host-side image of the byte-addressed NVM chip
pub const NVM_IMAGE_FILE_NAME: &str = "watermeter.nvm";

/// Runtime configuration, read from a JSON file by the simulator
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub backend: BackendKind,
}

/// Write-back policy of the sync coordinator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum seconds between two periodic flushes of the pulse counter
    pub flush_interval_secs: u32,
    /// Clock readings before this Unix time mean the clock was never set
    pub sanity_epoch_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 600,
            sanity_epoch_secs: DEFAULT_SANITY_EPOCH_SECS,
        }
    }
}

impl SyncConfig {
    pub fn with_flush_interval_secs(mut self, secs: u32) -> Self {
        self.flush_interval_secs = secs;
        self
    }

    pub fn flush_interval(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.flush_interval_secs))
    }

    pub fn sanity_epoch(&self) -> NaiveDateTime {
        from_unix_secs(self.sanity_epoch_secs)
    }
}

/// Storage medium the state record lives on
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Fixed-width comma-separated record in a plain file
    FlatFile,
    /// One entry per field in a paged key-value store
    PagedKv,
    /// Validated JSON object in a plain file
    #[default]
    Json,
    /// Fixed-width record at a fixed offset of byte-addressed memory
    Nvm,
}

impl BackendKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::FlatFile => "flat-file",
            Self::PagedKv => "paged-kv",
            Self::Json => "json",
            Self::Nvm => "nvm",
        }
    }
}

impl FromStr for BackendKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat-file" | "flat" => Ok(Self::FlatFile),
            "paged-kv" | "btree" => Ok(Self::PagedKv),
            "json" => Ok(Self::Json),
            "nvm" | "fram" => Ok(Self::Nvm),
            _ => Err("expected one of: flat-file, paged-kv, json, nvm"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"sync": {"flush_interval_secs": 60}, "backend": "nvm"}"#)
                .unwrap();
        assert_eq!(config.sync.flush_interval_secs, 60);
        assert_eq!(config.sync.sanity_epoch_secs, DEFAULT_SANITY_EPOCH_SECS);
        assert_eq!(config.backend, BackendKind::Nvm);
    }

    #[test]
    fn backend_kind_labels_parse_back() {
        for kind in [
            BackendKind::FlatFile,
            BackendKind::PagedKv,
            BackendKind::Json,
            BackendKind::Nvm,
        ] {
            assert_eq!(kind.label().parse::<BackendKind>(), Ok(kind));
        }
        assert!("sqlite".parse::<BackendKind>().is_err());
    }
}
