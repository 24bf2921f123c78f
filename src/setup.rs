// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! One-shot channel setup.
//!
//! Opens the notification channel, picks the operating mode, installs the
//! configured watches, and produces the shared [`Context`] the event loop
//! and its collaborators read for the rest of the process lifetime.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::config::MonitorConfig;
use crate::fanotify::Channel;

/// Shared monitor context.
///
/// Written once here, read-only everywhere else. The channel closes when
/// the last holder drops its reference, releasing all marks.
#[derive(Debug)]
pub struct Context {
    /// The open notification channel.
    pub channel: Channel,
    /// Event mask installed on every watch.
    pub mask: u64,
    /// Maximum file size submitted for scanning (0 = unlimited).
    pub size_limit: u64,
    /// Log extra per-file detail with each verdict.
    pub extended_info: bool,
    /// Whether watch installation was deferred to directory discovery.
    pub ddd_enabled: bool,
    /// Keep running after a queue handoff failure.
    pub retry_on_error: bool,
    /// Consecutive handoff failures tolerated.
    pub retry_attempts: u32,
    /// The full configuration, for collaborators that need more.
    pub config: Arc<MonitorConfig>,
}

/// Fatal setup failures; the monitor does not start.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("fanotify requires elevated privileges (CAP_SYS_ADMIN)")]
    Privilege(#[source] io::Error),
    #[error("fanotify initialization failed")]
    Init(#[source] io::Error),
    #[error("cannot watch '{path}'")]
    Mark {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no watch source specified: set mountPaths or includePaths, or enable directory discovery")]
    NoWatchTarget,
}

/// Where watches come from, by fixed precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSource {
    /// Recursive mount-scoped watches on the configured mount paths.
    MountPaths,
    /// Installation deferred to the directory discovery thread.
    Discovery,
    /// Non-recursive watches on the configured include paths.
    IncludePaths,
}

/// Pick the watch source. First match wins, no fallthrough: mount paths
/// beat discovery, discovery beats include paths.
pub fn select_watch_source(config: &MonitorConfig) -> Result<WatchSource, SetupError> {
    if !config.mount_paths.is_empty() {
        Ok(WatchSource::MountPaths)
    } else if !config.disable_ddd {
        Ok(WatchSource::Discovery)
    } else if !config.include_paths.is_empty() {
        Ok(WatchSource::IncludePaths)
    } else {
        Err(SetupError::NoWatchTarget)
    }
}

/// Build the event mask for the configured mode.
///
/// Enforcing mode (permission bits on top of access/open) requires the
/// prevention option and no mount-wide watch: mount watches never carry
/// permission semantics. Child-event propagation is always requested.
#[must_use]
pub fn event_mask(config: &MonitorConfig) -> u64 {
    let mut mask = libc::FAN_EVENT_ON_CHILD | libc::FAN_ACCESS | libc::FAN_OPEN;
    if config.prevention && config.mount_paths.is_empty() {
        mask |= libc::FAN_ACCESS_PERM | libc::FAN_OPEN_PERM;
    }
    mask
}

/// Initialize the monitor: open the channel, install watches, load limits.
///
/// Never partially retries; any single watch installation failure aborts
/// setup, naming the failing path.
pub fn initialize(config: Arc<MonitorConfig>) -> Result<Context, SetupError> {
    let channel = Channel::open().map_err(|e| {
        if e.raw_os_error() == Some(libc::EPERM) {
            SetupError::Privilege(e)
        } else {
            SetupError::Init(e)
        }
    })?;

    let mask = event_mask(&config);
    if mask & crate::fanotify::PERM_EVENT_MASK != 0 {
        info!("kernel-level blocking enabled, access waits for scan verdicts");
    } else {
        info!("kernel-level blocking disabled, running in notification mode");
        if config.prevention && !config.mount_paths.is_empty() {
            info!("prevention is unavailable when watching mounts");
        }
    }

    let mut ddd_enabled = false;
    match select_watch_source(&config)? {
        WatchSource::MountPaths => {
            for path in &config.mount_paths {
                channel.mark_mount(path, mask).map_err(|e| SetupError::Mark {
                    path: path.clone(),
                    source: e,
                })?;
                info!("watching mount point '{}' recursively", path.display());
            }
        }
        WatchSource::Discovery => {
            ddd_enabled = true;
            info!("watch installation deferred to directory discovery");
        }
        WatchSource::IncludePaths => {
            for path in &config.include_paths {
                channel.mark_path(path, mask).map_err(|e| SetupError::Mark {
                    path: path.clone(),
                    source: e,
                })?;
                info!("watching directory '{}' (non-recursively)", path.display());
            }
        }
    }

    if config.max_file_size > 0 {
        info!("max scanned file size limited to {} bytes", config.max_file_size);
    } else {
        info!("file size limit disabled");
    }

    Ok(Context {
        channel,
        mask,
        size_limit: config.max_file_size,
        extended_info: config.extended_info,
        ddd_enabled,
        retry_on_error: config.retry_on_error,
        retry_attempts: config.retry_attempts,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> MonitorConfig {
        MonitorConfig::default()
    }

    #[test]
    fn mount_paths_win_over_everything() {
        // Include paths must never be consulted while a mount path is set
        let cfg = MonitorConfig {
            mount_paths: vec![PathBuf::from("/mnt/data")],
            include_paths: vec![PathBuf::from("/home/user")],
            disable_ddd: false,
            ..config()
        };
        assert_matches!(select_watch_source(&cfg), Ok(WatchSource::MountPaths));
    }

    #[test]
    fn discovery_wins_over_include_paths() {
        let cfg = MonitorConfig {
            include_paths: vec![PathBuf::from("/home/user")],
            disable_ddd: false,
            ..config()
        };
        assert_matches!(select_watch_source(&cfg), Ok(WatchSource::Discovery));
    }

    #[test]
    fn include_paths_used_when_discovery_disabled() {
        let cfg = MonitorConfig {
            include_paths: vec![PathBuf::from("/home/user")],
            disable_ddd: true,
            ..config()
        };
        assert_matches!(select_watch_source(&cfg), Ok(WatchSource::IncludePaths));
    }

    #[test]
    fn no_source_is_an_error() {
        let cfg = MonitorConfig {
            disable_ddd: true,
            ..config()
        };
        assert_matches!(select_watch_source(&cfg), Err(SetupError::NoWatchTarget));
    }

    #[test]
    fn advisory_mask_has_no_permission_bits() {
        // prevention off, include paths only
        let cfg = MonitorConfig {
            include_paths: vec![PathBuf::from("/home/user")],
            disable_ddd: true,
            prevention: false,
            ..config()
        };
        let mask = event_mask(&cfg);
        assert_eq!(mask & libc::FAN_ACCESS, libc::FAN_ACCESS);
        assert_eq!(mask & libc::FAN_OPEN, libc::FAN_OPEN);
        assert_eq!(mask & libc::FAN_EVENT_ON_CHILD, libc::FAN_EVENT_ON_CHILD);
        assert_eq!(mask & crate::fanotify::PERM_EVENT_MASK, 0);
    }

    #[test]
    fn enforcing_mask_adds_permission_bits() {
        let cfg = MonitorConfig {
            include_paths: vec![PathBuf::from("/home/user")],
            disable_ddd: true,
            prevention: true,
            ..config()
        };
        let mask = event_mask(&cfg);
        assert_eq!(mask & libc::FAN_ACCESS_PERM, libc::FAN_ACCESS_PERM);
        assert_eq!(mask & libc::FAN_OPEN_PERM, libc::FAN_OPEN_PERM);
        // The base bits stay on top of the permission bits
        assert_eq!(mask & libc::FAN_ACCESS, libc::FAN_ACCESS);
        assert_eq!(mask & libc::FAN_OPEN, libc::FAN_OPEN);
    }

    #[test]
    fn mount_watch_never_carries_permission_bits() {
        // Prevention requested, but mount-wide watches disallow blocking
        let cfg = MonitorConfig {
            mount_paths: vec![PathBuf::from("/mnt/data")],
            prevention: true,
            ..config()
        };
        let mask = event_mask(&cfg);
        assert_eq!(mask & crate::fanotify::PERM_EVENT_MASK, 0);
        assert_eq!(mask & libc::FAN_ACCESS, libc::FAN_ACCESS);
        assert_eq!(mask & libc::FAN_OPEN, libc::FAN_OPEN);
    }
}
