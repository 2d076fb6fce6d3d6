// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The HTTP transport behind the download scheduler.
//!
//! The [`Transport`] trait is the seam between scheduling policy and wire
//! I/O: the scheduler decides *what* runs, a transport moves the bytes. The
//! production implementation is [`HttpTransport`] on `ureq`; scheduler tests
//! substitute their own.

use crate::{errors::DownloadError, helpers::CHUNK_SIZE};
use camino::Utf8Path;
use http::StatusCode;
use std::{
    fs,
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::debug;
use ureq::Agent;

/// Per-transfer control flags, checked between buffer-sized reads.
#[derive(Debug, Default)]
pub struct TransferCtl {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl TransferCtl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Asks the transfer to stop at the next I/O boundary, keeping its
    /// bytes for a later resume.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_pause(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    /// True if a pause has been requested.
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Asks the transfer to stop at the next I/O boundary and discard.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// True if the transfer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// One transfer handed to a [`Transport`].
#[derive(Clone, Copy, Debug)]
pub struct TransferRequest<'a> {
    /// The URL to fetch.
    pub url: &'a str,

    /// The local sink path.
    pub dest: &'a Utf8Path,

    /// Expected bytes on disk when the range is honoured.
    pub expected_size: u64,

    /// Remote offset to begin at.
    pub range_start: u64,

    /// Bytes already on disk from a previous, paused or interrupted attempt.
    pub resume_offset: u64,
}

/// How a transfer ended, short of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Every expected byte is on disk.
    Complete {
        /// Bytes on disk.
        bytes_on_disk: u64,
        /// True if the sink holds `remote[range_start..]`; false if the
        /// server ignored the range and the full body was stored.
        range_honored: bool,
    },
    /// The transfer stopped at an I/O boundary after a pause request.
    Paused {
        /// Bytes on disk, retained for the resume.
        bytes_on_disk: u64,
    },
}

/// Moves the bytes of a single transfer.
pub trait Transport: Send + Sync {
    /// Runs one transfer to completion, pause, or error.
    fn transfer(
        &self,
        request: &TransferRequest<'_>,
        ctl: &TransferCtl,
    ) -> Result<TransferStatus, DownloadError>;
}

/// The production [`Transport`]: HTTP `GET` with `Range` support.
pub struct HttpTransport {
    agent: Agent,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: Agent::new_with_config(config),
        }
    }
}

impl Transport for HttpTransport {
    fn transfer(
        &self,
        request: &TransferRequest<'_>,
        ctl: &TransferCtl,
    ) -> Result<TransferStatus, DownloadError> {
        let network_err = |error: ureq::Error| DownloadError::Network {
            url: request.url.to_owned(),
            error: Box::new(error),
        };
        let io_err = |error: io::Error| DownloadError::Io {
            path: request.dest.to_owned(),
            error,
        };

        let offset = request.range_start + request.resume_offset;
        let want_range = offset > 0;
        let mut get = self.agent.get(request.url);
        if want_range {
            get = get.header("Range", format!("bytes={offset}-"));
        }
        let response = get.call().map_err(network_err)?;
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;

        // The sink holds remote[range_start..] when the range was honoured
        // (trivially so without one); a server that ignored the range serves
        // the full body, prefix included, and the transfer restarts.
        let range_honored = request.range_start == 0 || partial;
        let (mut sink, mut written) = if want_range && partial {
            let sink = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(request.dest)
                .map_err(io_err)?;
            (sink, request.resume_offset)
        } else {
            if want_range {
                debug!("server ignored range request for {}", request.url);
            }
            (fs::File::create(request.dest).map_err(io_err)?, 0)
        };

        let expected_total = if range_honored {
            request.expected_size
        } else {
            request.expected_size.saturating_add(request.range_start)
        };

        let mut reader = response.into_body().into_reader();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if ctl.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if ctl.pause_requested() {
                sink.flush().map_err(io_err)?;
                return Ok(TransferStatus::Paused {
                    bytes_on_disk: written,
                });
            }
            let n = reader.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).map_err(io_err)?;
            written += n as u64;
            if written > expected_total {
                // The server is serving a longer body than declared; there
                // is no point reading the rest.
                return Err(DownloadError::SizeMismatch {
                    expected: expected_total,
                    actual: written,
                    url: request.url.to_owned(),
                });
            }
        }
        sink.flush().map_err(io_err)?;

        if written != expected_total {
            return Err(DownloadError::SizeMismatch {
                expected: expected_total,
                actual: written,
                url: request.url.to_owned(),
            });
        }
        Ok(TransferStatus::Complete {
            bytes_on_disk: written,
            range_honored,
        })
    }
}
