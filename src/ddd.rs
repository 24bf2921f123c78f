// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Directory discovery for path-scoped watching.
//!
//! When no mount is marked, path-scoped marks only cover a directory and
//! its direct children. This thread walks the include trees at startup and
//! installs a mark on every directory found, so events fire below the top
//! level too. Failures on individual directories are logged and skipped;
//! a tree that partially vanishes mid-walk is normal.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};
use log::{debug, info, warn};

use crate::setup::Context;

/// Handle to the discovery thread.
pub struct DddHandle {
    stop_tx: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl DddHandle {
    /// Start discovery over the configured include paths.
    pub fn spawn(ctx: Arc<Context>) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("ddd".to_string())
            .spawn(move || run(&ctx, &stop_rx))
            .context("spawning the directory discovery thread failed")?;
        Ok(Self { stop_tx, thread })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(self) -> Result<()> {
        // A send error means the thread already exited, which is fine
        let _ = self.stop_tx.send(());
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("directory discovery thread panicked"))
    }
}

fn run(ctx: &Context, stop_rx: &mpsc::Receiver<()>) {
    let mut marked = 0_usize;
    for root in &ctx.config.include_paths {
        marked += mark_tree(ctx, root);
    }
    info!("directory discovery installed {marked} watch(es)");

    // Park until shutdown; the marks live as long as the channel does
    let _ = stop_rx.recv();
    debug!("directory discovery stopped");
}

/// Walk one tree depth-first, marking every directory. Returns the number
/// of marks installed.
fn mark_tree(ctx: &Context, root: &Path) -> usize {
    let mut marked = 0;
    if let Err(e) = ctx.channel.mark_path(root, ctx.mask) {
        warn!("could not watch '{}': {e}", root.display());
        return 0;
    }
    marked += 1;

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("could not list '{}': {e}", root.display());
            return marked;
        }
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            marked += mark_tree(ctx, &entry.path());
        }
    }
    marked
}
