// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Configuration types for series-federation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::codec::{CompressionLevel, CompressionType};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FederationConfig {
    /// Named storage instances
    pub storages: BTreeMap<String, StorageDefinition>,

    /// Validity windows per tier
    pub topology: TopologyConfig,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub migration: MigrationSettings,

    #[serde(default)]
    pub temporary: TemporaryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        let mut storages = BTreeMap::new();
        storages.insert(
            "hot".to_string(),
            StorageDefinition {
                backend: "memory".to_string(),
                backend_config: BackendConfig::Memory {},
                concurrency: ConcurrencyConfig::default(),
            },
        );
        storages.insert(
            "cold".to_string(),
            StorageDefinition {
                backend: "filesystem".to_string(),
                backend_config: BackendConfig::Filesystem {
                    filesystem: FilesystemConfig::default(),
                },
                concurrency: ConcurrencyConfig::default(),
            },
        );

        Self {
            storages,
            topology: TopologyConfig {
                dynamic: vec![TopologyRule::unbounded("hot")],
                volume: vec![TopologyRule::unbounded("cold")],
            },
            client: ClientSettings::default(),
            migration: MigrationSettings::default(),
            temporary: TemporaryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One storage instance with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageDefinition {
    /// Backend type: "memory", "filesystem"
    pub backend: String,

    /// Backend-specific configuration
    #[serde(flatten)]
    pub backend_config: BackendConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Filesystem {
        #[serde(rename = "filesystem")]
        filesystem: FilesystemConfig,
    },
    Memory {},
}

impl BackendConfig {
    pub fn as_filesystem(&self) -> Option<&FilesystemConfig> {
        match self {
            BackendConfig::Filesystem { filesystem } => Some(filesystem),
            _ => None,
        }
    }

    pub fn as_filesystem_mut(&mut self) -> Option<&mut FilesystemConfig> {
        match self {
            BackendConfig::Filesystem { filesystem } => Some(filesystem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: String,

    /// Upper bound of one uncompressed blob
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,

    #[serde(default)]
    pub compression: CompressionType,

    #[serde(default)]
    pub compression_level: CompressionLevel,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: "/data/series".to_string(),
            max_blob_bytes: default_max_blob_bytes(),
            compression: CompressionType::default(),
            compression_level: CompressionLevel::default(),
        }
    }
}

/// Concurrent backend calls allowed per storage instance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_reads")]
    pub max_reads: usize,

    #[serde(default = "default_max_writes")]
    pub max_writes: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_reads: default_max_reads(),
            max_writes: default_max_writes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopologyConfig {
    /// Hot tier windows; writes are routed here
    #[serde(default)]
    pub dynamic: Vec<TopologyRule>,

    /// Cold tier windows; migration target
    #[serde(default)]
    pub volume: Vec<TopologyRule>,
}

/// Declares a storage authoritative for matching ids within `[from, to)`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyRule {
    pub storage: String,

    /// Regex the id must match; all ids when absent
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub from: Option<DateTime<Utc>>,

    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl TopologyRule {
    pub fn unbounded(storage: &str) -> Self {
        Self {
            storage: storage.to_string(),
            pattern: None,
            from: None,
            to: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientSettings {
    /// Publish written series to subscribers
    #[serde(default = "default_true")]
    pub publish_after_write: bool,

    /// Retries per storage for retryable write failures
    #[serde(default)]
    pub write_retries: u32,

    /// Entries per batcher flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            publish_after_write: true,
            write_retries: 0,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl ClientSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigrationSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Entries younger than this stay in the hot tier
    #[serde(default = "default_retain_hot")]
    pub retain_hot_seconds: u64,

    /// Keys swept periodically
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_sweep_interval(),
            segment_size: default_segment_size(),
            retain_hot_seconds: default_retain_hot(),
            keys: Vec::new(),
        }
    }
}

impl MigrationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn retain_hot(&self) -> Duration {
        Duration::from_secs(self.retain_hot_seconds)
    }
}

/// Side channel for series whose primary write failed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemporaryConfig {
    /// "none", "memory" or "filesystem"
    #[serde(default = "default_temporary_backend")]
    pub backend: String,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_temporary_max_bytes")]
    pub max_bytes: u64,
}

impl Default for TemporaryConfig {
    fn default() -> Self {
        Self {
            backend: default_temporary_backend(),
            path: None,
            max_bytes: default_temporary_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,  // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String,  // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_max_blob_bytes() -> usize { 64 * 1024 }
fn default_max_reads() -> usize { 32 }
fn default_max_writes() -> usize { 16 }
fn default_batch_size() -> usize { 1000 }
fn default_flush_interval_ms() -> u64 { 500 }
fn default_sweep_interval() -> u64 { 300 }
fn default_segment_size() -> usize { 10_000 }
fn default_retain_hot() -> u64 { 24 * 60 * 60 }
fn default_temporary_backend() -> String { "none".to_string() }
fn default_temporary_max_bytes() -> u64 { 256 * 1024 * 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
