/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the Myelin messaging layer
///
/// This struct contains all configurable values for Myelin, loaded from TOML
/// files in XDG-compliant directories.
///
/// # Example
///
/// ```toml
/// [timeouts]
/// connect_ms = 5000
/// retry_ms = 50
///
/// [limits]
/// queue_capacity = 64
/// async_buffer = 16
///
/// [paths]
/// runtime_directory = "/run/myelin"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct MyelinConfig {
    /// Timeout configuration
    pub timeouts: TimeoutConfig,
    /// Limits and capacity configuration
    pub limits: LimitsConfig,
    /// Path configuration for allocated socket addresses
    pub paths: PathsConfig,
    /// Tracing and logging configuration
    pub tracing: TracingConfig,
}

/// Timeout-related configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total budget for attaching to an address that may not exist yet, in milliseconds
    pub connect_ms: u64,
    /// Interval between attach retries in milliseconds
    pub retry_ms: u64,
    /// Bound on draining a work port's parts in milliseconds
    pub drain_ms: u64,
    /// Bound on driver and background task teardown in milliseconds
    pub shutdown_ms: u64,
}

/// Limits and capacity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bounded depth of queue transports and socket inbound queues
    pub queue_capacity: usize,
    /// Bounded depth of the async wrapper's message buffer
    pub async_buffer: usize,
    /// Soft cap on a single frame, in bytes
    pub max_frame_bytes: usize,
    /// Frames a bound sender holds before its first peer connects
    pub backlog: usize,
}

/// Path configuration for allocated socket addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for allocated Unix socket files; empty means auto-detect
    pub runtime_directory: String,
}

/// Tracing and logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Default level for the facade's subscriber setup
    pub default_level: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            retry_ms: 50,
            drain_ms: 10_000,
            shutdown_ms: 5_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            async_buffer: 16,
            max_frame_bytes: crate::message::frame::MAX_FRAME_SIZE,
            backlog: 256,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_directory: String::new(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
        }
    }
}

impl TimeoutConfig {
    /// Convert the attach budget to a Duration
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Convert the attach retry interval to a Duration
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    /// Convert the work-port drain bound to a Duration
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    /// Convert the teardown bound to a Duration
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

impl PathsConfig {
    /// Directory allocated Unix sockets are created in.
    ///
    /// An explicit `runtime_directory` wins; otherwise the XDG runtime
    /// directory, falling back to a `myelin` directory under the system
    /// temp dir.
    pub fn socket_directory(&self) -> PathBuf {
        if !self.runtime_directory.is_empty() {
            return PathBuf::from(&self.runtime_directory);
        }
        if let Ok(dirs) = xdg::BaseDirectories::with_prefix("myelin") {
            if let Ok(dir) = dirs.create_runtime_directory("") {
                return dir;
            }
        }
        std::env::temp_dir().join("myelin")
    }
}

impl MyelinConfig {
    /// Load configuration from XDG-compliant locations
    ///
    /// This function attempts to load configuration from the following locations
    /// in order of preference:
    /// 1. `$XDG_CONFIG_HOME/myelin/config.toml` (Linux/macOS)
    /// 2. `~/.config/myelin/config.toml` (Linux fallback)
    /// 3. `~/Library/Application Support/myelin/config.toml` (macOS fallback)
    ///
    /// If no configuration file is found, returns the default configuration.
    /// If a configuration file exists but is malformed, logs an error and uses defaults.
    pub fn load() -> Self {
        use tracing::{debug, error};

        let xdg_dirs = match xdg::BaseDirectories::with_prefix("myelin") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {}", e);
                return Self::default();
            }
        };

        let config_path = xdg_dirs.find_config_file("config.toml");

        if let Some(path) = config_path {
            debug!("Loading configuration from: {}", path.display());
            match Self::load_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Failed to load configuration file {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            debug!("No configuration file found, using defaults");
            Self::default()
        }
    }

    /// Parses one specific configuration file, bypassing the XDG search.
    pub fn load_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<Self>(&config_str)
            .with_context(|| format!("parsing {}", path.display()))
    }
}

lazy_static! {
    /// Global configuration instance loaded from XDG-compliant locations
    pub static ref CONFIG: MyelinConfig = MyelinConfig::load();
}
