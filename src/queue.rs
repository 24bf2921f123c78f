// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Non-blocking handoff channel between the event loop and the scan
//! consumer.
//!
//! A push either transfers ownership of the whole request, descriptor
//! included, or returns it to the caller synchronously. The event loop is
//! never suspended on a full queue.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::fanotify::RawEventMetadata;

/// One scan request, built per qualifying kernel event.
///
/// Owns the event descriptor: whoever holds the request is responsible for
/// the single close, and for the verdict write if `permission` is set.
#[derive(Debug)]
pub struct ScanRequest {
    /// Resolved pathname of the accessed file.
    pub path: PathBuf,
    /// Verbatim copy of the kernel event record.
    pub metadata: RawEventMetadata,
    /// The event-bearing descriptor.
    pub fd: OwnedFd,
    /// Whether the file content should be scanned.
    pub scan: bool,
    /// Whether the request originated from the kernel notification channel.
    pub from_fanotify: bool,
    /// Whether the file operation is blocked pending a verdict.
    pub permission: bool,
}

/// Sending half of the scan queue.
#[derive(Debug, Clone)]
pub struct ScanQueue {
    tx: mpsc::Sender<ScanRequest>,
}

impl ScanQueue {
    /// Create a bounded queue; the receiver goes to the consumer.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ScanRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push a request without blocking.
    ///
    /// On success the request (and its descriptor) belongs to the consumer.
    /// On failure the request is handed back untouched.
    pub fn push(&self, request: ScanRequest) -> Result<(), ScanRequest> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(r) | TrySendError::Closed(r) => r,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanotify;

    fn request() -> ScanRequest {
        let file = tempfile::tempfile().expect("temp file");
        ScanRequest {
            path: PathBuf::from("/tmp/a"),
            metadata: fanotify::tests::record(libc::FAN_OPEN, -1, 1),
            fd: OwnedFd::from(file),
            scan: true,
            from_fanotify: true,
            permission: false,
        }
    }

    #[test]
    fn push_transfers_request() {
        let (queue, mut rx) = ScanQueue::bounded(1);
        queue.push(request()).expect("push");
        let received = rx.try_recv().expect("request queued");
        assert_eq!(received.path, PathBuf::from("/tmp/a"));
    }

    #[test]
    fn full_queue_returns_request() {
        let (queue, _rx) = ScanQueue::bounded(1);
        queue.push(request()).expect("first push fits");
        let bounced = queue.push(request());
        assert!(bounced.is_err());
    }

    #[test]
    fn closed_queue_returns_request() {
        let (queue, rx) = ScanQueue::bounded(1);
        drop(rx);
        assert!(queue.push(request()).is_err());
    }
}
