// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread daemon state.
//!
//! The stop request is the only thing the signal path ever touches: one
//! atomic store plus one pipe write, both async-signal-safe. Teardown
//! itself runs later, outside any signal context, in [`crate::shutdown`].

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::pipe::PipeFlags;

/// Shared stop and teardown bookkeeping.
#[derive(Debug)]
pub struct DaemonState {
    stop: AtomicBool,
    channel_open: AtomicBool,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl DaemonState {
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(Self {
            stop: AtomicBool::new(false),
            channel_open: AtomicBool::new(false),
            wake_rx,
            wake_tx,
        })
    }

    /// Request a stop: set the flag and wake the event loop's poll.
    /// Idempotent; only the first call writes the wake byte.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            let _ = rustix::io::write(&self.wake_tx, &[1u8]);
        }
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Read end of the wake pipe, polled by the event loop next to the
    /// notification channel.
    #[must_use]
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.wake_rx.as_fd()
    }

    /// Record that the notification channel is open and owned.
    pub fn mark_channel_open(&self) {
        self.channel_open.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    /// Atomically claim the right to close the channel. Returns true for
    /// exactly one caller, so the channel can never be closed twice.
    pub fn try_mark_channel_closed(&self) -> bool {
        self.channel_open.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_wakes_once() {
        let state = DaemonState::new().expect("state");
        assert!(!state.stop_requested());

        state.request_stop();
        state.request_stop();
        assert!(state.stop_requested());

        // Exactly one wake byte, even after two requests
        let mut buf = [0u8; 8];
        let n = rustix::io::read(&state.wake_rx, &mut buf).expect("wake byte");
        assert_eq!(n, 1);
        assert!(rustix::io::read(&state.wake_rx, &mut buf).is_err());
    }

    #[test]
    fn channel_close_claim_is_single_shot() {
        let state = DaemonState::new().expect("state");
        state.mark_channel_open();
        assert!(state.channel_open());

        assert!(state.try_mark_channel_closed());
        assert!(!state.try_mark_channel_closed());
        assert!(!state.channel_open());
    }

    #[test]
    fn closing_unopened_channel_claims_nothing() {
        let state = DaemonState::new().expect("state");
        assert!(!state.try_mark_channel_closed());
    }
}
