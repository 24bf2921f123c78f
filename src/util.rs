// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use log::info;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

// =============================================================================
// Logger
// =============================================================================

/// Initialize the systemd journal logger.
///
/// # Errors
/// Returns an error if the journal logger fails to initialize.
pub fn init_logger(debug: bool) -> Result<()> {
    let log_level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    systemd_journal_logger::JournalLog::new()?.install()?;
    log::set_max_level(log_level);
    Ok(())
}

// =============================================================================
// Signal Handling
// =============================================================================

/// Shutdown signal received.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
    Sigusr1,
}

/// Wait for a shutdown signal (SIGINT, SIGTERM, or the designated stop
/// signal SIGUSR1).
///
/// # Errors
/// Returns an error if signal handlers fail to initialize.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigusr1 =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received");
            Ok(ShutdownSignal::Sigint)
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            Ok(ShutdownSignal::Sigterm)
        }
        _ = sigusr1.recv() => {
            info!("SIGUSR1 received");
            Ok(ShutdownSignal::Sigusr1)
        }
    }
}

/// Block every signal on the calling thread except the stop signal
/// (SIGUSR1) and the signals a process must never ignore: SIGILL, SIGSEGV,
/// SIGBUS, SIGFPE, plus SIGINT for interactive use.
///
/// Installed for the lifetime of the event-loop thread so arbitrary signal
/// delivery cannot interrupt a blocking fanotify read mid-batch.
///
/// # Errors
/// Returns an error if the thread signal mask cannot be updated.
pub fn mask_loop_signals() -> Result<()> {
    let mut mask = SigSet::all();
    mask.remove(Signal::SIGUSR1);
    mask.remove(Signal::SIGILL);
    mask.remove(Signal::SIGSEGV);
    mask.remove(Signal::SIGBUS);
    mask.remove(Signal::SIGFPE);
    mask.remove(Signal::SIGINT);
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)?;
    Ok(())
}
