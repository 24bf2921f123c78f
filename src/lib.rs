// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! On-access virus scanning monitor built on Linux fanotify.
//!
//! The monitor intercepts file opens and accesses on configured mounts or
//! directories, resolves each kernel event to a path, filters by process
//! owner, and hands qualifying events to an asynchronous scanning pipeline.
//! With prevention enabled the underlying file operation is blocked until
//! a scan verdict is written back to the kernel.
//!
//! # Modules
//!
//! - [`fanotify`] - kernel notification protocol: channel, read outcomes,
//!   bounds-checked event record decoder
//! - [`setup`] - one-shot channel setup and watch installation
//! - [`event_loop`] - the blocking event loop turning kernel records into
//!   scan requests or immediate verdicts
//! - [`owner`] - originating-process owner filter
//! - [`queue`] - non-blocking handoff to the scan consumer
//! - [`scanner`] - clamd scan client (fd passing over a unix socket)
//! - [`consumer`] - scan-request consumer producing verdicts
//! - [`ddd`] - dynamic directory discovery thread
//! - [`state`] / [`shutdown`] - stop signalling and idempotent teardown

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod consumer;
pub mod ddd;
pub mod event_loop;
pub mod fanotify;
pub mod owner;
pub mod queue;
pub mod scanner;
pub mod setup;
pub mod shutdown;
pub mod state;
pub mod util;
