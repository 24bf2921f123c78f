// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Originating-process owner filter.
//!
//! Classifies the process behind each kernel event so the monitor never
//! scans its own file accesses (feedback loop) and can skip processes
//! owned by excluded uids, such as the scan engine itself.

use crate::config::MonitorConfig;

/// Classification of an event's originating process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerClass {
    /// Scan normally.
    NotExcluded,
    /// Owned by an excluded uid; skip and log.
    ExcludedOther,
    /// The monitor's own process; skip silently.
    ExcludedSelf,
}

/// Filter over excluded process owners.
#[derive(Debug, Clone)]
pub struct OwnerFilter {
    own_pid: u32,
    excluded_uids: Vec<u32>,
}

impl OwnerFilter {
    #[must_use]
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            own_pid: std::process::id(),
            excluded_uids: config.excluded_uids.clone(),
        }
    }

    /// Classify the process with the given pid.
    ///
    /// The uid owning the process is read from `/proc`; a process that
    /// vanished before the lookup classifies as not excluded, since its
    /// event descriptor is still perfectly scannable.
    #[must_use]
    pub fn classify(&self, pid: i32) -> OwnerClass {
        if pid >= 0 && pid as u32 == self.own_pid {
            return OwnerClass::ExcludedSelf;
        }
        if self.excluded_uids.is_empty() {
            return OwnerClass::NotExcluded;
        }
        match rustix::fs::stat(format!("/proc/{pid}")) {
            Ok(stat) if self.excluded_uids.contains(&stat.st_uid) => OwnerClass::ExcludedOther,
            _ => OwnerClass::NotExcluded,
        }
    }
}
