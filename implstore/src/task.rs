// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator interfaces for progress reporting and cancellation.
//!
//! The store and fetcher report long-running work through a caller-supplied
//! [`TaskHandler`]. The handler also owns the [`CancelToken`] that is checked
//! between buffer-sized reads in every suspension point (network reads, disk
//! reads and writes, hash updates).

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A cooperatively-checked cancellation token.
///
/// Cloning produces another handle to the same token.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. All holders observe it at their next check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Description of a unit of work passed to [`TaskHandler`] callbacks.
#[derive(Clone, Debug)]
pub struct TaskInfo<'a> {
    /// Human-readable name of the subject, e.g. a digest or an archive URL.
    pub name: &'a str,

    /// Total size in bytes, if known up front.
    pub total_bytes: Option<u64>,
}

impl<'a> TaskInfo<'a> {
    pub(crate) fn new(name: &'a str) -> Self {
        Self {
            name,
            total_bytes: None,
        }
    }
}

/// Progress reporting and cancellation, implemented by the caller.
///
/// All methods other than [`cancel_token`](Self::cancel_token) have no-op
/// defaults so non-interactive callers only need to supply a token.
pub trait TaskHandler: Send + Sync {
    /// Called when extraction of an archive begins.
    fn starting_extraction(&self, _task: &TaskInfo<'_>) {}

    /// Called when manifest generation over a directory tree begins.
    fn starting_manifest(&self, _task: &TaskInfo<'_>) {}

    /// Called when a named top-level operation begins.
    fn run_task(&self, _task: &TaskInfo<'_>, _title: &str) {}

    /// Incremental progress for the most recent task.
    fn progress(&self, _task: &TaskInfo<'_>, _bytes_so_far: u64) {}

    /// The token long-running operations poll for cancellation.
    fn cancel_token(&self) -> &CancelToken;

    /// Whether the handler is in non-interactive batch mode.
    fn batch(&self) -> bool {
        false
    }
}

/// A [`TaskHandler`] that reports nothing and runs in batch mode.
#[derive(Debug, Default)]
pub struct SilentHandler {
    token: CancelToken,
}

impl SilentHandler {
    /// Creates a handler with a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler driven by an existing token.
    pub fn with_token(token: CancelToken) -> Self {
        Self { token }
    }
}

impl TaskHandler for SilentHandler {
    fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    fn batch(&self) -> bool {
        true
    }
}
