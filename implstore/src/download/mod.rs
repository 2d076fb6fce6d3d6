// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Download jobs and the scheduler that runs them.
//!
//! A [`DownloadJob`] is an ordered set of files fetched on behalf of one
//! higher-level operation. The [`DownloadScheduler`] runs jobs under a
//! configurable simultaneity cap with priority preemption: when a
//! higher-priority job arrives and every slot is busy, the lowest-priority
//! running transfer that supports resume is paused (its bytes retained) and
//! later restarted with an HTTP `Range` request. Transfers that cannot
//! resume are never paused; once started they run to completion even while
//! they keep the in-flight count above the cap.

mod http;
mod scheduler;

pub use http::{HttpTransport, TransferCtl, TransferRequest, TransferStatus, Transport};
pub use scheduler::{DownloadScheduler, JobId};

use camino::Utf8PathBuf;

/// Scheduling priority; higher values run first. Ties are broken by job
/// insertion order, then file order within the job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Background work.
    pub const LOW: Priority = Priority(-10);
    /// The default.
    pub const NORMAL: Priority = Priority(0);
    /// Work the user is waiting on; preempts resumable transfers.
    pub const HIGH: Priority = Priority(10);
}

/// One file within a [`DownloadJob`].
#[derive(Clone, Debug)]
pub struct DownloadFile {
    /// Absolute URL to fetch.
    pub url: String,

    /// Local sink path the bytes are written to.
    pub dest: Utf8PathBuf,

    /// The byte count expected on disk when the range is honoured. With a
    /// `range_start` the server ignores, the full body lands on disk and the
    /// expectation grows by `range_start`.
    pub expected_size: u64,

    /// Remote offset to begin at; used to skip the non-archive prefix of
    /// self-extracting installers without downloading it.
    pub range_start: u64,

    /// Whether an interrupted transfer may be resumed with a `Range`
    /// request. Non-resumable transfers restart from zero and are never
    /// paused by preemption.
    pub supports_resume: bool,
}

/// An ordered set of files downloaded at one priority.
#[derive(Clone, Debug)]
pub struct DownloadJob {
    /// The job's scheduling priority.
    pub priority: Priority,

    /// The files, in deterministic start order. Files must be unique within
    /// the job.
    pub files: Vec<DownloadFile>,
}

/// Scheduling state of one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    /// Waiting for a slot (or for a retry backoff to elapse).
    Queued,
    /// A transfer is in flight.
    Running,
    /// Preempted; bytes retained, eligible to restart.
    Paused,
    /// All bytes are on disk and the size checked out.
    Completed,
    /// Failed after exhausting retries.
    Failed,
    /// The job was cancelled before this file completed.
    Cancelled,
}

/// Scheduling state of one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Some files are still queued or in flight.
    Running,
    /// Every file completed.
    Completed,
    /// A file failed; remaining files were cancelled.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

/// What one completed file transfer produced.
#[derive(Clone, Debug)]
pub struct FileOutcome {
    /// The URL that was fetched.
    pub url: String,

    /// Bytes on disk at the sink path.
    pub bytes_on_disk: u64,

    /// True if the sink holds `remote[range_start..]`; false if the server
    /// ignored the range and the sink holds the full body, prefix included.
    pub range_honored: bool,
}
