// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Default clamd control socket.
pub const DEFAULT_CLAMD_SOCKET: &str = "/var/run/clamav/clamd.ctl";

/// Default maximum file size submitted for scanning (5 MiB, 0 = unlimited).
const fn default_max_file_size() -> u64 {
    5 * 1024 * 1024
}

/// Default bound on consecutive queue-handoff failures before giving up.
const fn default_retry_attempts() -> u32 {
    3
}

/// Default scan queue capacity.
const fn default_queue_capacity() -> usize {
    100
}

fn default_clamd_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CLAMD_SOCKET)
}

/// Monitor configuration.
///
/// Loaded from a JSON file; every field has a default so a partial file
/// (or none at all) is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Mount points to watch recursively. When set, these take precedence
    /// over both directory discovery and `include_paths`.
    pub mount_paths: Vec<PathBuf>,

    /// Directories to watch non-recursively. Consulted only when no mount
    /// paths are given and directory discovery is disabled.
    pub include_paths: Vec<PathBuf>,

    /// Disable the dynamic directory discovery thread.
    pub disable_ddd: bool,

    /// Block file operations until a scan verdict is produced. Ignored for
    /// mount watches, which never carry permission semantics.
    pub prevention: bool,

    /// Maximum file size submitted for scanning in bytes (0 = unlimited).
    /// Larger files skip the scan and are allowed.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Log extra detail (size, descriptor) for each scanned file.
    pub extended_info: bool,

    /// Events from processes owned by these uids are not scanned.
    pub excluded_uids: Vec<u32>,

    /// Keep running after a scan queue handoff failure.
    pub retry_on_error: bool,

    /// Consecutive handoff failures tolerated while `retry_on_error` is set.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Scan queue capacity (pending requests).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Path to the clamd control socket.
    #[serde(default = "default_clamd_socket")]
    pub clamd_socket: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mount_paths: Vec::new(),
            include_paths: Vec::new(),
            disable_ddd: false,
            prevention: false,
            max_file_size: default_max_file_size(),
            extended_info: false,
            excluded_uids: Vec::new(),
            retry_on_error: false,
            retry_attempts: default_retry_attempts(),
            queue_capacity: default_queue_capacity(),
            clamd_socket: default_clamd_socket(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.mount_paths.is_empty() && self.include_paths.is_empty() && self.disable_ddd {
            bail!("no watch source: set mountPaths or includePaths, or enable directory discovery");
        }
        for path in self.mount_paths.iter().chain(&self.include_paths) {
            if !path.is_absolute() {
                bail!("watch path '{}' must be absolute", path.display());
            }
        }
        if self.queue_capacity == 0 {
            bail!("queueCapacity must be greater than zero");
        }
        if self.retry_on_error && self.retry_attempts == 0 {
            bail!("retryAttempts must be greater than zero when retryOnError is set");
        }
        Ok(())
    }
}

/// Verify a configuration file without starting the daemon.
pub fn verify_config(path: &Path) -> Result<()> {
    let config = MonitorConfig::load(path)?;

    info!("configuration OK: {}", path.display());
    info!(
        "  mount paths: {}, include paths: {}, discovery: {}",
        config.mount_paths.len(),
        config.include_paths.len(),
        if config.disable_ddd { "disabled" } else { "enabled" }
    );
    info!(
        "  prevention: {}, max file size: {}, excluded uids: {}",
        config.prevention,
        config.max_file_size,
        config.excluded_uids.len()
    );
    Ok(())
}
