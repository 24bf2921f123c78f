// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Fanotify kernel protocol layer.
//!
//! Wraps `fanotify_init`/`fanotify_mark`, reads raw event batches with a
//! tagged outcome instead of errno multiplexing, and decodes batches into
//! validated [`EventRecord`] values. Each record owns its event descriptor,
//! so a descriptor is closed exactly once: either by the record's owner
//! dropping it, or by whoever the descriptor was handed off to.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Read buffer for one event batch, matching the kernel's per-read limit
/// used by comparable monitors.
pub const EVENT_BUFFER_SIZE: usize = 4096;

/// Metadata record size on the wire.
pub const EVENT_METADATA_SIZE: usize = mem::size_of::<RawEventMetadata>();

/// Permission-class event bits: the kernel blocks the file operation until
/// a response is written for these.
pub const PERM_EVENT_MASK: u64 = libc::FAN_ACCESS_PERM | libc::FAN_OPEN_PERM;

// =============================================================================
// Event records
// =============================================================================

/// Verbatim copy of the kernel's `fanotify_event_metadata` record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEventMetadata {
    pub event_len: u32,
    pub vers: u8,
    pub reserved: u8,
    pub metadata_len: u16,
    pub mask: u64,
    pub fd: i32,
    pub pid: i32,
}

/// One decoded kernel event. Owns the event-bearing descriptor, if any.
#[derive(Debug)]
pub struct EventRecord {
    meta: RawEventMetadata,
    fd: Option<OwnedFd>,
}

impl EventRecord {
    /// The raw metadata exactly as the kernel delivered it.
    #[must_use]
    pub const fn metadata(&self) -> &RawEventMetadata {
        &self.meta
    }

    #[must_use]
    pub const fn mask(&self) -> u64 {
        self.meta.mask
    }

    /// Pid of the process that triggered the event.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.meta.pid
    }

    /// Whether the record's protocol version matches the compiled one.
    #[must_use]
    pub const fn is_current_version(&self) -> bool {
        self.meta.vers == libc::FANOTIFY_METADATA_VERSION
    }

    /// Whether the kernel event queue overflowed before this record.
    #[must_use]
    pub const fn is_queue_overflow(&self) -> bool {
        self.meta.mask & libc::FAN_Q_OVERFLOW != 0
    }

    /// Whether the file operation is blocked pending a verdict.
    #[must_use]
    pub const fn is_permission(&self) -> bool {
        self.meta.mask & PERM_EVENT_MASK != 0
    }

    /// Take ownership of the event descriptor. `None` for descriptor-less
    /// records (queue overflow).
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

// =============================================================================
// Batch decoder
// =============================================================================

/// Decode the metadata records of a batch without touching descriptor
/// ownership.
///
/// Finite and restartable: iterating the same byte slice any number of
/// times yields identical records and leaves every event descriptor
/// untouched. Use this for inspection; [`decode`] claims the descriptors.
#[must_use]
pub fn decode_metadata(data: &[u8]) -> MetadataIter<'_> {
    MetadataIter { rest: data }
}

/// Decode a raw event batch into owned records.
///
/// Claims ownership of every event descriptor in the batch, which the
/// kernel transferred with the read. A batch must therefore be decoded
/// this way at most once; a second owning pass over the same bytes would
/// mint a second owner for each descriptor and close it twice. Repeated
/// inspection goes through [`decode_metadata`].
#[must_use]
pub fn decode(data: &[u8]) -> EventIter<'_> {
    EventIter {
        inner: decode_metadata(data),
    }
}

/// Lazy iterator over the metadata records of one read batch.
///
/// Every record's bounds are validated before any field access, mirroring
/// the kernel's `FAN_EVENT_OK` predicate: iteration stops at the first
/// record whose length field is shorter than a metadata record or longer
/// than the bytes remaining.
pub struct MetadataIter<'a> {
    rest: &'a [u8],
}

impl Iterator for MetadataIter<'_> {
    type Item = RawEventMetadata;

    fn next(&mut self) -> Option<RawEventMetadata> {
        if self.rest.len() < EVENT_METADATA_SIZE {
            return None;
        }

        let meta = parse_metadata(self.rest);
        let event_len = meta.event_len as usize;
        if event_len < EVENT_METADATA_SIZE || event_len > self.rest.len() {
            return None;
        }
        self.rest = &self.rest[event_len..];
        Some(meta)
    }
}

/// Owning iterator over the records of one read batch.
pub struct EventIter<'a> {
    inner: MetadataIter<'a>,
}

impl Iterator for EventIter<'_> {
    type Item = EventRecord;

    fn next(&mut self) -> Option<EventRecord> {
        let meta = self.inner.next()?;

        // SAFETY: the kernel transfers ownership of each event descriptor
        // to the reader; this is the single point that assumes it, and the
        // batch is traversed by this iterator once.
        let fd = (meta.fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(meta.fd) });

        Some(EventRecord { meta, fd })
    }
}

/// Read one metadata record from the front of `data`.
/// Caller guarantees `data.len() >= EVENT_METADATA_SIZE`.
fn parse_metadata(data: &[u8]) -> RawEventMetadata {
    let field = |range: std::ops::Range<usize>| &data[range];
    RawEventMetadata {
        event_len: u32::from_ne_bytes(field(0..4).try_into().expect("4-byte field")),
        vers: data[4],
        reserved: data[5],
        metadata_len: u16::from_ne_bytes(field(6..8).try_into().expect("2-byte field")),
        mask: u64::from_ne_bytes(field(8..16).try_into().expect("8-byte field")),
        fd: i32::from_ne_bytes(field(16..20).try_into().expect("4-byte field")),
        pid: i32::from_ne_bytes(field(20..24).try_into().expect("4-byte field")),
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Outcome of one read from the notification channel.
///
/// Transient kernel faults are separate variants so the caller recovers
/// each one explicitly instead of matching on errno.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A batch of `n` raw bytes was read.
    Data(usize),
    /// The kernel event queue overflowed (EOVERFLOW).
    Overflow,
    /// Read denied by mandatory access control (EACCES).
    AccessDenied,
    /// The process ran out of file descriptors (EMFILE).
    TooManyDescriptors,
    /// Interrupted by a signal (EINTR).
    Interrupted,
    /// Unrecoverable read failure.
    Fatal(rustix::io::Errno),
}

/// Verdict written back for a permission-class event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The fanotify notification channel. Owns the group descriptor; marks are
/// released implicitly when the channel is dropped.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Open the notification channel: content-inspection class with
    /// unlimited queue and marks, event descriptors opened read-only with
    /// large-file support.
    pub fn open() -> io::Result<Self> {
        let flags = libc::FAN_CLASS_CONTENT | libc::FAN_UNLIMITED_QUEUE | libc::FAN_UNLIMITED_MARKS;
        let event_f_flags = (libc::O_RDONLY | libc::O_LARGEFILE) as libc::c_uint;
        // SAFETY: no pointer arguments.
        let fd = unsafe { libc::fanotify_init(flags, event_f_flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by fanotify_init and is owned here.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Install a recursive, mount-scoped watch.
    pub fn mark_mount(&self, path: &Path, mask: u64) -> io::Result<()> {
        self.mark(libc::FAN_MARK_ADD | libc::FAN_MARK_MOUNT, mask, path)
    }

    /// Install a non-recursive, path-scoped watch.
    pub fn mark_path(&self, path: &Path, mask: u64) -> io::Result<()> {
        self.mark(libc::FAN_MARK_ADD, mask, path)
    }

    fn mark(&self, flags: libc::c_uint, mask: u64, path: &Path) -> io::Result<()> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: cpath outlives the call.
        let rc = unsafe {
            libc::fanotify_mark(
                self.fd.as_raw_fd(),
                flags,
                mask,
                libc::AT_FDCWD,
                cpath.as_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read one batch of raw event bytes.
    pub fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        match rustix::io::read(&self.fd, buf) {
            Ok(n) => ReadOutcome::Data(n),
            Err(e) => match e.raw_os_error() {
                code if code == libc::EOVERFLOW => ReadOutcome::Overflow,
                code if code == libc::EACCES => ReadOutcome::AccessDenied,
                code if code == libc::EMFILE => ReadOutcome::TooManyDescriptors,
                code if code == libc::EINTR => ReadOutcome::Interrupted,
                _ => ReadOutcome::Fatal(e),
            },
        }
    }

    /// Write one fixed-size verdict for the given event descriptor.
    ///
    /// Exactly one response must be written per permission-class record,
    /// before its descriptor is closed.
    pub fn respond(&self, event_fd: BorrowedFd<'_>, verdict: Verdict) -> io::Result<()> {
        let response = libc::fanotify_response {
            fd: event_fd.as_raw_fd(),
            response: match verdict {
                Verdict::Allow => libc::FAN_ALLOW,
                Verdict::Deny => libc::FAN_DENY,
            },
        };
        // SAFETY: fanotify_response is plain old data; the slice borrows it.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(&response).cast::<u8>(),
                mem::size_of::<libc::fanotify_response>(),
            )
        };
        let written = rustix::io::write(&self.fd, bytes).map_err(io::Error::from)?;
        if written != bytes.len() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        Ok(())
    }

    /// Raw group descriptor, for polling alongside other descriptors.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Wrap an existing descriptor, for tests that stand in a pipe for the
    /// kernel channel.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
