// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! The fanotify event loop.
//!
//! Runs on a dedicated blocking thread: waits for the notification channel
//! to become readable, reads a batch of raw records, and turns each record
//! into either a scan request or an immediate verdict. Transient kernel
//! faults (queue overflow, MAC denial, descriptor exhaustion) are recovered
//! in place; everything else terminates the loop with a distinct error.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use rustix::event::{PollFd, PollFlags};
use thiserror::Error;

use crate::fanotify::{self, EventRecord, ReadOutcome, Verdict, EVENT_BUFFER_SIZE};
use crate::owner::{OwnerClass, OwnerFilter};
use crate::queue::{ScanQueue, ScanRequest};
use crate::setup::Context;
use crate::state::DaemonState;

// =============================================================================
// Constants
// =============================================================================

/// Rolling window bounding overflow log volume under sustained drops.
const OVERFLOW_LOG_WINDOW: Duration = Duration::from_secs(30);

/// Backoff while the consumer side releases descriptors.
const DESCRIPTOR_BACKOFF: Duration = Duration::from_secs(3);

// =============================================================================
// Errors and exit status
// =============================================================================

/// Why the loop stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The stop flag was observed at a wait step.
    Stopped,
}

/// Fatal loop failures. `Read` is the fatal-read class; the rest are
/// protocol failures. Both end the on-access service.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("fanotify read failed")]
    Read(#[source] rustix::io::Errno),
    #[error("waiting on the notification channel failed")]
    Wait(#[source] rustix::io::Errno),
    #[error("resolving the path for event descriptor {fd} failed")]
    Resolve {
        fd: i32,
        #[source]
        source: io::Error,
    },
    #[error("writing a permission response failed")]
    Response(#[source] io::Error),
    #[error("scan queue handoff failed {attempts} consecutive times")]
    QueueHandoff { attempts: u32 },
}

// =============================================================================
// Recovery bookkeeping
// =============================================================================

/// Allows one log line per rolling window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Whether a log line is allowed now; restarts the window if so.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.window);
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Consecutive queue-handoff failure counter.
#[derive(Debug)]
pub struct RetryCounter {
    enabled: bool,
    max: u32,
    consecutive: u32,
}

impl RetryCounter {
    #[must_use]
    pub const fn new(enabled: bool, max: u32) -> Self {
        Self {
            enabled,
            max,
            consecutive: 0,
        }
    }

    /// Any successful handoff clears the streak.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure. Returns true while the loop may keep going:
    /// retries enabled and the counter still below the maximum when the
    /// failure arrived.
    pub fn record_failure(&mut self) -> bool {
        let proceed = self.enabled && self.consecutive < self.max;
        self.consecutive += 1;
        proceed
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.consecutive
    }
}

// =============================================================================
// Event loop
// =============================================================================

/// What woke the loop up.
enum Wake {
    Ready,
    Stop,
}

pub struct EventLoop {
    ctx: Arc<Context>,
    state: Arc<DaemonState>,
    queue: ScanQueue,
    filter: OwnerFilter,
    overflow_log: RateLimiter,
    retries: RetryCounter,
    scan: bool,
}

impl EventLoop {
    #[must_use]
    pub fn new(
        ctx: Arc<Context>,
        state: Arc<DaemonState>,
        queue: ScanQueue,
        filter: OwnerFilter,
    ) -> Self {
        let retries = RetryCounter::new(ctx.retry_on_error, ctx.retry_attempts);
        Self {
            ctx,
            state,
            queue,
            filter,
            overflow_log: RateLimiter::new(OVERFLOW_LOG_WINDOW),
            retries,
            scan: true,
        }
    }

    /// Disable scanning: queued requests are marked pre-cleared, so the
    /// consumer allows them without contacting the scanner.
    pub fn set_scan(&mut self, scan: bool) {
        self.scan = scan;
    }

    /// Run until the stop flag is observed or a fatal error occurs.
    pub fn run(&mut self) -> Result<LoopExit, LoopError> {
        let mut buf = [0u8; EVENT_BUFFER_SIZE];
        loop {
            if let Wake::Stop = self.wait()? {
                debug!("event loop observed stop request");
                return Ok(LoopExit::Stopped);
            }

            match self.ctx.channel.read(&mut buf) {
                ReadOutcome::Data(n) => self.process_batch(&buf[..n])?,
                ReadOutcome::Overflow => {
                    if self.overflow_log.allow() {
                        warn!("fanotify event queue overflowed, events were dropped, recovering");
                    }
                }
                ReadOutcome::AccessDenied => {
                    warn!(
                        "fanotify read denied by mandatory access control, \
                         check the SELinux/AppArmor audit logs and consider an exception, recovering"
                    );
                }
                ReadOutcome::TooManyDescriptors => {
                    warn!(
                        "out of file descriptors, waiting {}s for the scan consumer to catch up",
                        DESCRIPTOR_BACKOFF.as_secs()
                    );
                    std::thread::sleep(DESCRIPTOR_BACKOFF);
                }
                ReadOutcome::Interrupted => {}
                ReadOutcome::Fatal(errno) => {
                    error!("fanotify read failed: {errno}");
                    return Err(LoopError::Read(errno));
                }
            }
        }
    }

    /// Block until the channel is readable or a stop is requested.
    /// Interruption by a non-stop signal re-enters the wait.
    fn wait(&self) -> Result<Wake, LoopError> {
        loop {
            if self.state.stop_requested() {
                return Ok(Wake::Stop);
            }

            let channel_fd = self.ctx.channel.as_fd();
            let wake_fd = self.state.wake_fd();
            let mut fds = [
                PollFd::new(&channel_fd, PollFlags::IN),
                PollFd::new(&wake_fd, PollFlags::IN),
            ];
            match rustix::event::poll(&mut fds, None) {
                Ok(_) => {
                    if self.state.stop_requested() {
                        return Ok(Wake::Stop);
                    }
                    if fds[0].revents().intersects(PollFlags::IN) {
                        return Ok(Wake::Ready);
                    }
                }
                Err(e) if e.raw_os_error() == libc::EINTR => {}
                Err(e) => {
                    error!("polling the notification channel failed: {e}");
                    return Err(LoopError::Wait(e));
                }
            }
        }
    }

    /// Process one batch in kernel-delivery order.
    fn process_batch(&mut self, data: &[u8]) -> Result<(), LoopError> {
        for mut record in fanotify::decode(data) {
            if record.is_queue_overflow() {
                if self.overflow_log.allow() {
                    warn!("fanotify event queue overflowed, events were dropped, recovering");
                }
                continue;
            }
            if !record.is_current_version() {
                warn!(
                    "event record version {} does not match compiled version {}, dropping record",
                    record.metadata().vers,
                    libc::FANOTIFY_METADATA_VERSION
                );
                continue;
            }
            let Some(fd) = record.take_fd() else {
                continue;
            };
            self.process_record(&record, fd)?;
        }
        Ok(())
    }

    /// Handle one record. The descriptor is closed exactly once: by the
    /// consumer after a successful handoff, or here on every other path.
    fn process_record(&mut self, record: &EventRecord, fd: OwnedFd) -> Result<(), LoopError> {
        let path = match resolve_event_path(&fd) {
            Ok(path) => path,
            Err(e) if is_benign_resolution_failure(&e) => {
                // The file vanished between event delivery and resolution;
                // abandon this record and resume at the next one.
                debug!("event descriptor {} already invalid: {e}", fd.as_raw_fd());
                return Ok(());
            }
            Err(e) => {
                error!("resolving event descriptor {} failed: {e}", fd.as_raw_fd());
                return Err(LoopError::Resolve {
                    fd: fd.as_raw_fd(),
                    source: e,
                });
            }
        };

        match self.filter.classify(record.pid()) {
            OwnerClass::NotExcluded => self.enqueue(record, fd, path),
            class @ (OwnerClass::ExcludedOther | OwnerClass::ExcludedSelf) => {
                if record.is_permission() {
                    // Excluded processes fail open: allow before closing
                    self.ctx
                        .channel
                        .respond(fd.as_fd(), Verdict::Allow)
                        .map_err(|e| {
                            error!("allow response for excluded process failed: {e}");
                            LoopError::Response(e)
                        })?;
                }
                if class == OwnerClass::ExcludedOther {
                    debug!("'{}' skipped (excluded uid)", path.display());
                }
                Ok(())
            }
        }
    }

    fn enqueue(&mut self, record: &EventRecord, fd: OwnedFd, path: PathBuf) -> Result<(), LoopError> {
        let request = ScanRequest {
            path,
            metadata: *record.metadata(),
            fd,
            scan: self.scan,
            from_fanotify: true,
            permission: record.is_permission(),
        };

        match self.queue.push(request) {
            Ok(()) => {
                self.retries.reset();
                Ok(())
            }
            Err(request) => {
                // Closes the descriptor; the consumer never saw it
                let path = request.path.clone();
                drop(request);
                if self.retries.record_failure() {
                    warn!(
                        "scan queue refused event for '{}' ({} consecutive failures), recovering",
                        path.display(),
                        self.retries.attempts()
                    );
                    Ok(())
                } else {
                    error!(
                        "scan queue handoff failed {} consecutive times, giving up",
                        self.retries.attempts()
                    );
                    Err(LoopError::QueueHandoff {
                        attempts: self.retries.attempts(),
                    })
                }
            }
        }
    }
}

/// Resolve the path behind an event descriptor through its proc entry.
fn resolve_event_path(fd: &OwnedFd) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// A resolution failure caused by the descriptor already being invalid is
/// a benign race with the filesystem, not an error.
fn is_benign_resolution_failure(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOENT | libc::EBADF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::fanotify::tests::{donate_fd, encode, record};
    use crate::fanotify::Channel;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    // =========================================================================
    // RateLimiter
    // =========================================================================

    #[test]
    fn rate_limiter_allows_once_per_window() {
        let mut limiter = RateLimiter::new(Duration::from_secs(30));
        let start = Instant::now();

        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_secs(1)));
        assert!(!limiter.allow_at(start + Duration::from_secs(29)));
        // First fault after the window closes logs again and restarts it
        assert!(limiter.allow_at(start + Duration::from_secs(30)));
        assert!(!limiter.allow_at(start + Duration::from_secs(59)));
        assert!(limiter.allow_at(start + Duration::from_secs(60)));
    }

    // =========================================================================
    // RetryCounter
    // =========================================================================

    #[test]
    fn retry_counter_tolerates_max_failures() {
        // max=3: three consecutive failures recover, the fourth is fatal
        let mut retries = RetryCounter::new(true, 3);
        assert!(retries.record_failure());
        assert!(retries.record_failure());
        assert!(retries.record_failure());
        assert!(!retries.record_failure());
        assert_eq!(retries.attempts(), 4);
    }

    #[test]
    fn retry_counter_resets_on_success() {
        let mut retries = RetryCounter::new(true, 1);
        assert!(retries.record_failure());
        retries.reset();
        assert!(retries.record_failure());
    }

    #[test]
    fn disabled_retries_fail_immediately() {
        let mut retries = RetryCounter::new(false, 10);
        assert!(!retries.record_failure());
    }

    // =========================================================================
    // Path resolution
    // =========================================================================

    #[test]
    fn resolves_open_descriptor_to_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"contents").expect("write");
        let fd = OwnedFd::from(std::fs::File::open(&path).expect("open"));

        let resolved = resolve_event_path(&fd).expect("resolve");
        assert_eq!(resolved, path.canonicalize().expect("canonical"));
    }

    #[test]
    fn invalid_descriptor_resolution_is_benign() {
        // A descriptor number far beyond anything the process has open
        let err = fs::read_link("/proc/self/fd/999999").expect_err("stale");
        assert!(is_benign_resolution_failure(&err));
    }

    // =========================================================================
    // Batch processing against a pipe standing in for the kernel channel
    // =========================================================================

    fn harness(config: MonitorConfig, capacity: usize) -> (EventLoop, TestEnds) {
        let (verdict_rx, verdict_tx) = rustix::pipe::pipe_with(
            rustix::pipe::PipeFlags::NONBLOCK,
        )
        .expect("pipe");
        let config = Arc::new(config);
        let ctx = Arc::new(Context {
            channel: Channel::from_fd(verdict_tx),
            mask: crate::setup::event_mask(&config),
            size_limit: config.max_file_size,
            extended_info: false,
            ddd_enabled: false,
            retry_on_error: config.retry_on_error,
            retry_attempts: config.retry_attempts,
            config: Arc::clone(&config),
        });
        let state = Arc::new(DaemonState::new().expect("state"));
        let (queue, scan_rx) = ScanQueue::bounded(capacity);
        let filter = OwnerFilter::from_config(&config);
        let event_loop = EventLoop::new(ctx, state, queue, filter);
        (event_loop, TestEnds { verdict_rx, scan_rx })
    }

    struct TestEnds {
        verdict_rx: OwnedFd,
        scan_rx: tokio::sync::mpsc::Receiver<ScanRequest>,
    }

    impl TestEnds {
        fn read_verdicts(&self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = [0u8; 64];
            while let Ok(n) = rustix::io::read(&self.verdict_rx, &mut buf) {
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        }
    }

    #[test]
    fn non_excluded_record_yields_one_push() {
        let (mut event_loop, mut ends) = harness(MonitorConfig::default(), 4);

        let raw = donate_fd();
        // pid 1 is never this process, and no uids are excluded
        let meta = record(libc::FAN_OPEN, raw, 1);
        let buf = encode(&meta);

        event_loop.process_batch(&buf).expect("batch");

        let request = ends.scan_rx.try_recv().expect("one push");
        assert_eq!(request.metadata, meta);
        assert!(request.scan);
        assert!(request.from_fanotify);
        assert!(!request.permission);
        assert_eq!(request.fd.as_raw_fd(), raw);
        // No further pushes, no verdicts written
        assert!(ends.scan_rx.try_recv().is_err());
        assert!(ends.read_verdicts().is_empty());
    }

    #[test]
    fn excluded_permission_record_gets_one_allow_and_no_push() {
        let (mut event_loop, mut ends) = harness(MonitorConfig::default(), 4);

        let raw = donate_fd();
        let own_pid = i32::try_from(std::process::id()).expect("pid fits");
        let meta = record(libc::FAN_OPEN_PERM, raw, own_pid);
        let buf = encode(&meta);

        event_loop.process_batch(&buf).expect("batch");

        assert!(ends.scan_rx.try_recv().is_err());
        let verdicts = ends.read_verdicts();
        // Exactly one fixed-size response carrying ALLOW for the event fd
        assert_eq!(verdicts.len(), std::mem::size_of::<libc::fanotify_response>());
        let fd = i32::from_ne_bytes(verdicts[0..4].try_into().expect("4 bytes"));
        let response = u32::from_ne_bytes(verdicts[4..8].try_into().expect("4 bytes"));
        assert_eq!(fd, raw);
        assert_eq!(response, libc::FAN_ALLOW);
    }

    #[test]
    fn excluded_non_permission_record_closes_quietly() {
        let (mut event_loop, mut ends) = harness(MonitorConfig::default(), 4);

        let raw = donate_fd();
        let own_pid = i32::try_from(std::process::id()).expect("pid fits");
        let buf = encode(&record(libc::FAN_OPEN, raw, own_pid));

        event_loop.process_batch(&buf).expect("batch");

        assert!(ends.scan_rx.try_recv().is_err());
        assert!(ends.read_verdicts().is_empty());
    }

    #[test]
    fn stale_descriptor_is_abandoned_and_batch_continues() {
        let (mut event_loop, mut ends) = harness(MonitorConfig::default(), 4);

        // A descriptor number nothing in the process has open
        let stale = 999_998;
        let live = donate_fd();

        let mut buf = encode(&record(libc::FAN_OPEN, stale, 1));
        buf.extend_from_slice(&encode(&record(libc::FAN_OPEN, live, 1)));

        event_loop.process_batch(&buf).expect("batch");

        // Only the live record reaches the queue
        let request = ends.scan_rx.try_recv().expect("live record pushed");
        assert_eq!(request.fd.as_raw_fd(), live);
        assert!(ends.scan_rx.try_recv().is_err());
    }

    #[test]
    fn push_failures_respect_the_retry_budget() {
        // Queue capacity 1 with nobody draining: the first record fills the
        // queue, later ones fail the handoff. max=3 tolerates three
        // failures and dies on the fourth.
        let config = MonitorConfig {
            retry_on_error: true,
            retry_attempts: 3,
            ..MonitorConfig::default()
        };
        let (mut event_loop, mut ends) = harness(config, 1);

        let mut buf = Vec::new();
        for _ in 0..4 {
            buf.extend_from_slice(&encode(&record(libc::FAN_OPEN, donate_fd(), 1)));
        }
        event_loop.process_batch(&buf).expect("three failures tolerated");

        let fifth = encode(&record(libc::FAN_OPEN, donate_fd(), 1));
        let err = event_loop.process_batch(&fifth).expect_err("budget exhausted");
        assert_matches!(err, LoopError::QueueHandoff { attempts: 4 });

        // The one successful push is still intact
        assert!(ends.scan_rx.try_recv().is_ok());
    }

    #[test]
    fn queued_descriptor_stays_open_for_the_consumer() {
        let config = MonitorConfig {
            retry_on_error: true,
            retry_attempts: 3,
            ..MonitorConfig::default()
        };
        let (mut event_loop, _ends) = harness(config, 1);

        let first = donate_fd();
        let mut buf = encode(&record(libc::FAN_OPEN, first, 1));
        buf.extend_from_slice(&encode(&record(libc::FAN_OPEN, donate_fd(), 1)));

        event_loop.process_batch(&buf).expect("batch");

        // The queued record's descriptor is alive, owned by the queue
        assert!(fs::read_link(format!("/proc/self/fd/{first}")).is_ok());
    }

    #[test]
    fn overflow_records_are_dropped_without_processing() {
        let (mut event_loop, mut ends) = harness(MonitorConfig::default(), 4);

        let buf = encode(&record(libc::FAN_Q_OVERFLOW, libc::FAN_NOFD, 0));
        event_loop.process_batch(&buf).expect("batch");

        assert!(ends.scan_rx.try_recv().is_err());
        assert!(ends.read_verdicts().is_empty());
    }
}
