// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Virus scanning backend for the on-access monitor.
//!
//! Scanning is fd-based: the event descriptor delivered by the kernel is
//! handed straight to the scanner, so the bytes inspected are the bytes
//! the triggering process sees (no path re-open race).
//!
//! Scan results distinguish between:
//! - `Clean`: File passed virus scan
//! - `Infected`: Virus/malware detected
//! - `Error`: Scan failed (connection lost, scanner unavailable)
//!
//! The consumer handles `Error` by failing open: a scanner outage must
//! not lock every file on the system.

use anyhow::Result;
use log::{debug, error, info, warn};
use sendfd::SendWithFd;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Result of a virus scan operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    /// File is clean
    Clean,
    /// File is infected (virus/malware detected) with signature name
    Infected(String),
    /// Scan error (connection failure, scanner unavailable)
    Error,
}

/// Virus scanner interface.
pub trait Scanner: Send + Sync {
    /// Validate that the scanner is available and functional.
    fn validate_availability(&self) -> Result<()>;

    /// Scan a file by file descriptor. The path is used only for logging.
    /// Returns `ScanVerdict::Error` for scan failures (consumer decides
    /// handling).
    fn scan_fd(&self, fd: BorrowedFd<'_>, path_for_logging: &Path) -> Result<ScanVerdict>;
}

/// `ClamAV` scanner using the FILDES command via Unix socket.
/// Passes the event descriptor itself, so clamd scans the exact file that
/// triggered the event.
pub struct ClamdScanner {
    socket: PathBuf,
}

impl ClamdScanner {
    #[must_use]
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    fn ping(&self) -> std::io::Result<String> {
        let mut stream = UnixStream::connect(&self.socket)?;
        stream.write_all(b"zPING\0")?;
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n])
            .trim_matches('\0')
            .trim()
            .to_string())
    }

    fn send_fd_for_scan(&self, fd: BorrowedFd<'_>) -> std::io::Result<String> {
        let mut stream = UnixStream::connect(&self.socket)?;
        stream.write_all(b"nFILDES\n")?;
        stream.send_with_fd(&[0], &[fd.as_raw_fd()])?;
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n])
            .trim_matches('\0')
            .trim()
            .to_string())
    }

    /// Parse a `ClamAV` response string into a `ScanVerdict`.
    #[must_use]
    pub fn parse_response(response: &str, name_for_logging: &str) -> ScanVerdict {
        if response.ends_with("OK") {
            debug!("Clean: {name_for_logging}");
            return ScanVerdict::Clean;
        }

        if response.ends_with("FOUND") {
            let signature = response
                .rsplit_once(": ")
                .map_or("unknown", |(_, s)| s.trim_end_matches(" FOUND"));
            warn!("Virus in {name_for_logging}: {signature}");
            return ScanVerdict::Infected(signature.to_string());
        }

        if response.ends_with("ERROR") {
            error!("ClamAV error for {name_for_logging}: {response}");
            return ScanVerdict::Error;
        }

        error!("Unexpected ClamAV response: {response}");
        ScanVerdict::Error
    }
}

impl Scanner for ClamdScanner {
    fn validate_availability(&self) -> Result<()> {
        let response = self.ping().map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to ClamAV at {}: {e}",
                self.socket.display()
            )
        })?;

        if response == "PONG" {
            info!("ClamAV daemon available: {}", self.socket.display());
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Unexpected ClamAV ping response: {response}"
            ))
        }
    }

    fn scan_fd(&self, fd: BorrowedFd<'_>, path_for_logging: &Path) -> Result<ScanVerdict> {
        debug!("ClamAV scanning fd for: {}", path_for_logging.display());

        let response = match self.send_fd_for_scan(fd) {
            Ok(r) => r,
            Err(e) => {
                error!("ClamAV connection error: {e}");
                return Ok(ScanVerdict::Error);
            }
        };

        Ok(Self::parse_response(
            &response,
            &path_for_logging.display().to_string(),
        ))
    }
}
