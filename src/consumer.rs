// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Scan queue consumer.
//!
//! Drains the scan queue on a dedicated blocking thread, scans each file
//! through the configured backend, and for permission-class events writes
//! the verdict back through the notification channel. Dropping a request's
//! descriptor here is the single close for queued events.

use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::fanotify::Verdict;
use crate::queue::ScanRequest;
use crate::scanner::{ScanVerdict, Scanner};
use crate::setup::Context;

/// Handle to the running consumer thread.
pub struct ConsumerHandle {
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Spawn the consumer. It runs until every queue sender is dropped.
    #[must_use]
    pub fn spawn(
        ctx: Arc<Context>,
        scanner: Arc<dyn Scanner>,
        rx: mpsc::Receiver<ScanRequest>,
    ) -> Self {
        let task = tokio::task::spawn_blocking(move || run(&ctx, scanner.as_ref(), rx));
        Self { task }
    }

    /// Wait for the consumer to drain the queue and exit.
    pub async fn stop(self) -> Result<()> {
        self.task.await.context("scan consumer thread panicked")
    }
}

fn run(ctx: &Context, scanner: &dyn Scanner, mut rx: mpsc::Receiver<ScanRequest>) {
    info!("scan consumer started");
    while let Some(request) = rx.blocking_recv() {
        process(ctx, scanner, request);
    }
    // All senders gone, nothing more can arrive
    info!("scan consumer finished");
}

/// Scan one request and deliver the verdict. Consumes the request, which
/// closes its event descriptor.
fn process(ctx: &Context, scanner: &dyn Scanner, request: ScanRequest) {
    let verdict = if request.scan {
        scan(ctx, scanner, &request)
    } else {
        ScanVerdict::Clean
    };

    if request.permission {
        let response = match verdict {
            ScanVerdict::Infected(ref signature) => {
                warn!(
                    "denying access to '{}': {signature}",
                    request.path.display()
                );
                Verdict::Deny
            }
            // Scan errors fail open so an unavailable scanner does not
            // block the whole mount
            ScanVerdict::Clean | ScanVerdict::Error => Verdict::Allow,
        };
        if let Err(e) = ctx.channel.respond(request.fd.as_fd(), response) {
            error!(
                "verdict for '{}' could not be delivered: {e}",
                request.path.display()
            );
        }
    }

    if ctx.extended_info {
        debug!(
            "processed event: path='{}' fd={} pid={} mask={:#x} permission={} verdict={verdict:?}",
            request.path.display(),
            request.fd.as_raw_fd(),
            request.metadata.pid,
            request.metadata.mask,
            request.permission,
        );
    }
}

fn scan(ctx: &Context, scanner: &dyn Scanner, request: &ScanRequest) -> ScanVerdict {
    match rustix::fs::fstat(&request.fd) {
        Ok(stat) => {
            #[allow(clippy::cast_sign_loss)]
            let size = stat.st_size as u64;
            // A limit of 0 disables the size check entirely
            if ctx.size_limit > 0 && size > ctx.size_limit {
                debug!(
                    "'{}' is {size} bytes, over the {} byte scan limit, skipping scan",
                    request.path.display(),
                    ctx.size_limit
                );
                return ScanVerdict::Clean;
            }
        }
        Err(e) => {
            debug!(
                "could not stat '{}' before scan: {e}",
                request.path.display()
            );
        }
    }

    match scanner.scan_fd(request.fd.as_fd(), &request.path) {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("scan of '{}' failed: {e}", request.path.display());
            ScanVerdict::Error
        }
    }
}
