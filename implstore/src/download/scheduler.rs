// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The download scheduler: a priority queue of jobs run on worker threads.
//!
//! All queue state lives behind one mutex. The lock is never held across
//! I/O: picking what to start happens under the lock, the chosen transfer
//! then runs on its own thread against the [`Transport`]. Preemption,
//! retry backoff, and completion all funnel back through [`pump`], which
//! re-examines the queue whenever a slot may have opened.

use super::{
    DownloadFile, DownloadJob, FileOutcome, FileState, JobState, TransferCtl, TransferRequest,
    TransferStatus, Transport,
};
use crate::{config::DownloadConfig, errors::DownloadError};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Handle to a job owned by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Runs download jobs with a simultaneity cap, priority preemption, and
/// deterministic retry backoff.
pub struct DownloadScheduler {
    shared: Arc<Shared>,
}

impl Clone for DownloadScheduler {
    /// Cloning yields another handle to the same queue.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    job_changed: Condvar,
    transport: Arc<dyn Transport>,
    max_simultaneous: usize,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Shared {
    /// Queue state is plain bookkeeping that stays consistent across a
    /// panicked holder, so a poisoned lock is recovered, not propagated.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct State {
    jobs: BTreeMap<u64, JobEntry>,
    next_id: u64,
    running: usize,
}

struct JobEntry {
    priority: super::Priority,
    state: JobState,
    files: Vec<FileEntry>,
    error: Option<DownloadError>,
}

struct FileEntry {
    spec: DownloadFile,
    state: FileState,
    attempts: u32,
    not_before: Option<Instant>,
    bytes_on_disk: u64,
    range_honored: bool,
    ctl: Arc<TransferCtl>,
}

impl FileEntry {
    fn new(spec: DownloadFile) -> Self {
        Self {
            spec,
            state: FileState::Queued,
            attempts: 0,
            not_before: None,
            bytes_on_disk: 0,
            range_honored: true,
            ctl: Arc::new(TransferCtl::new()),
        }
    }

    fn startable(&self, now: Instant) -> bool {
        matches!(self.state, FileState::Queued | FileState::Paused)
            && self.not_before.is_none_or(|t| t <= now)
    }
}

impl DownloadScheduler {
    /// Creates a scheduler over `transport`.
    pub fn new(config: &DownloadConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    jobs: BTreeMap::new(),
                    next_id: 0,
                    running: 0,
                }),
                job_changed: Condvar::new(),
                transport,
                max_simultaneous: config.max_simultaneous.max(1),
                max_attempts: config.max_attempts.max(1),
                initial_backoff: config.initial_backoff,
            }),
        }
    }

    /// Enqueues a job. Files start in the order they appear; across jobs,
    /// start order is (priority, insertion order).
    pub fn add_job(&self, job: DownloadJob) -> Result<JobId, DownloadError> {
        let mut seen = HashSet::new();
        for file in &job.files {
            if !seen.insert((file.url.clone(), file.dest.clone())) {
                return Err(DownloadError::DuplicateFile {
                    url: file.url.clone(),
                });
            }
        }

        let id = {
            let mut state = self.shared.lock_state();
            let id = state.next_id;
            state.next_id += 1;
            state.jobs.insert(
                id,
                JobEntry {
                    priority: job.priority,
                    state: JobState::Running,
                    files: job.files.into_iter().map(FileEntry::new).collect(),
                    error: None,
                },
            );
            id
        };
        pump(&self.shared);
        Ok(JobId(id))
    }

    /// Changes a job's priority, possibly preempting running transfers.
    pub fn update_job(&self, id: JobId, priority: super::Priority) {
        {
            let mut state = self.shared.lock_state();
            if let Some(job) = state.jobs.get_mut(&id.0) {
                job.priority = priority;
            }
        }
        pump(&self.shared);
    }

    /// Cancels a job. Running transfers stop at their next I/O boundary;
    /// partial bytes are discarded unless the file supports resume.
    pub fn remove_job(&self, id: JobId) {
        let mut state = self.shared.lock_state();
        let Some(job) = state.jobs.get_mut(&id.0) else {
            return;
        };
        if matches!(job.state, JobState::Running) {
            job.state = JobState::Cancelled;
        }
        for file in &mut job.files {
            match file.state {
                FileState::Running => file.ctl.cancel(),
                FileState::Queued | FileState::Paused => {
                    file.state = FileState::Cancelled;
                    discard_partial(file);
                }
                _ => {}
            }
        }
        self.shared.job_changed.notify_all();
    }

    /// The job's current state, if it is still known to the scheduler.
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        let state = self.shared.lock_state();
        state.jobs.get(&id.0).map(|job| job.state)
    }

    /// Blocks until the job reaches a terminal state, then consumes it.
    ///
    /// Returns one [`FileOutcome`] per file, in file order, on success.
    pub fn wait(&self, id: JobId) -> Result<Vec<FileOutcome>, DownloadError> {
        let mut state = self.shared.lock_state();
        loop {
            let Some(job) = state.jobs.get_mut(&id.0) else {
                return Err(DownloadError::Cancelled);
            };
            match job.state {
                JobState::Running => {}
                JobState::Completed => {
                    let outcomes = job
                        .files
                        .iter()
                        .map(|file| FileOutcome {
                            url: file.spec.url.clone(),
                            bytes_on_disk: file.bytes_on_disk,
                            range_honored: file.range_honored,
                        })
                        .collect();
                    state.jobs.remove(&id.0);
                    return Ok(outcomes);
                }
                JobState::Failed => {
                    let error = job.error.take().unwrap_or(DownloadError::Cancelled);
                    state.jobs.remove(&id.0);
                    return Err(error);
                }
                JobState::Cancelled => {
                    // Wait for in-flight transfers to acknowledge before
                    // consuming the entry.
                    if job
                        .files
                        .iter()
                        .all(|file| !matches!(file.state, FileState::Running))
                    {
                        state.jobs.remove(&id.0);
                        return Err(DownloadError::Cancelled);
                    }
                }
            }
            state = self
                .shared
                .job_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Picks and starts every transfer that may run right now. Requests a pause
/// from a lower-priority resumable transfer when a higher-priority candidate
/// is blocked on the cap.
fn pump(shared: &Arc<Shared>) {
    let mut state = shared.lock_state();
    let now = Instant::now();
    loop {
        let Some((job_id, file_index)) = next_candidate(&state, now) else {
            break;
        };
        let candidate_priority = state.jobs[&job_id].priority;

        if !may_start(&state, candidate_priority, shared.max_simultaneous) {
            request_preemption(&mut state, candidate_priority);
            break;
        }

        let Some(job) = state.jobs.get_mut(&job_id) else {
            break;
        };
        let file = &mut job.files[file_index];
        file.state = FileState::Running;
        file.ctl.clear_pause();
        let resume_offset = if file.spec.supports_resume {
            file.bytes_on_disk
        } else {
            0
        };
        let spec = file.spec.clone();
        let ctl = Arc::clone(&file.ctl);
        state.running += 1;

        let shared = Arc::clone(shared);
        thread::spawn(move || run_transfer(shared, job_id, file_index, spec, resume_offset, ctl));
    }
}

/// The highest-priority startable file: jobs by (priority desc, insertion
/// order), files in order within the job.
fn next_candidate(state: &State, now: Instant) -> Option<(u64, usize)> {
    let mut job_ids: Vec<u64> = state
        .jobs
        .iter()
        .filter(|(_, job)| matches!(job.state, JobState::Running))
        .map(|(id, _)| *id)
        .collect();
    job_ids.sort_by_key(|id| (std::cmp::Reverse(state.jobs[id].priority), *id));

    for id in job_ids {
        let job = &state.jobs[&id];
        if let Some(index) = job.files.iter().position(|file| file.startable(now)) {
            return Some((id, index));
        }
    }
    None
}

/// A candidate may start while a slot is free, or over the cap when every
/// excess slot is held by a lower-priority transfer that cannot be paused.
fn may_start(state: &State, candidate_priority: super::Priority, cap: usize) -> bool {
    if state.running < cap {
        return true;
    }
    let unpausable_overage = state
        .jobs
        .values()
        .filter(|job| job.priority < candidate_priority)
        .flat_map(|job| &job.files)
        .filter(|file| matches!(file.state, FileState::Running) && !file.spec.supports_resume)
        .count();
    state.running < cap + unpausable_overage
}

fn request_preemption(state: &mut State, candidate_priority: super::Priority) {
    // Pause the lowest-priority resumable running transfer, oldest job last.
    let victim = state
        .jobs
        .iter()
        .filter(|(_, job)| job.priority < candidate_priority)
        .flat_map(|(id, job)| {
            job.files
                .iter()
                .enumerate()
                .map(move |(index, file)| (job.priority, *id, index, file))
        })
        .filter(|(_, _, _, file)| {
            matches!(file.state, FileState::Running)
                && file.spec.supports_resume
                && !file.ctl.pause_requested()
        })
        .min_by_key(|(priority, id, index, _)| (*priority, std::cmp::Reverse(*id), *index));
    if let Some((_, id, index, file)) = victim {
        debug!(
            "pausing {} (job {id}, file {index}) for higher-priority work",
            file.spec.url
        );
        file.ctl.request_pause();
    }
}

fn run_transfer(
    shared: Arc<Shared>,
    job_id: u64,
    file_index: usize,
    spec: DownloadFile,
    resume_offset: u64,
    ctl: Arc<TransferCtl>,
) {
    let request = TransferRequest {
        url: &spec.url,
        dest: &spec.dest,
        expected_size: spec.expected_size,
        range_start: spec.range_start,
        resume_offset,
    };
    let result = shared.transport.transfer(&request, &ctl);

    // Bytes that survived a failed attempt seed the next one for resumable
    // files. Measured here so no disk I/O happens under the queue lock.
    let partial_len = if result.is_err() && spec.supports_resume {
        fs::metadata(&spec.dest).map(|meta| meta.len()).unwrap_or(0)
    } else {
        0
    };

    {
        let mut state = shared.lock_state();
        state.running -= 1;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            settle(&shared, job, file_index, result, partial_len);
        }
        shared.job_changed.notify_all();
    }
    pump(&shared);
}

/// Applies one transfer's result to the queue. Called with the lock held.
fn settle(
    shared: &Arc<Shared>,
    job: &mut JobEntry,
    file_index: usize,
    result: Result<TransferStatus, DownloadError>,
    partial_len: u64,
) {
    let cancelled = matches!(job.state, JobState::Cancelled);
    let file = &mut job.files[file_index];

    if cancelled {
        file.state = FileState::Cancelled;
        discard_partial(file);
        return;
    }

    match result {
        Ok(TransferStatus::Complete {
            bytes_on_disk,
            range_honored,
        }) => {
            file.state = FileState::Completed;
            file.bytes_on_disk = bytes_on_disk;
            file.range_honored = range_honored;
            if job
                .files
                .iter()
                .all(|file| matches!(file.state, FileState::Completed))
            {
                job.state = JobState::Completed;
            }
        }
        Ok(TransferStatus::Paused { bytes_on_disk }) => {
            file.state = FileState::Paused;
            file.bytes_on_disk = bytes_on_disk;
            file.ctl.clear_pause();
        }
        Err(DownloadError::Cancelled) => {
            file.state = FileState::Cancelled;
            discard_partial(file);
        }
        Err(error) => {
            file.attempts += 1;
            if error.is_retryable() && file.attempts < shared.max_attempts {
                // Deterministic exponential backoff; no jitter.
                let delay = shared.initial_backoff * 2u32.pow(file.attempts - 1);
                debug!(
                    "retrying {} in {delay:?} (attempt {} of {})",
                    file.spec.url,
                    file.attempts + 1,
                    shared.max_attempts,
                );
                file.state = FileState::Queued;
                file.not_before = Some(Instant::now() + delay);
                file.bytes_on_disk = if file.spec.supports_resume {
                    partial_len
                } else {
                    0
                };
                let shared = Arc::clone(shared);
                thread::spawn(move || {
                    thread::sleep(delay);
                    pump(&shared);
                });
            } else {
                warn!("download of {} failed: {error}", file.spec.url);
                file.state = FileState::Failed;
                job.state = JobState::Failed;
                job.error = Some(error);
                for other in &mut job.files {
                    match other.state {
                        FileState::Running => other.ctl.cancel(),
                        FileState::Queued | FileState::Paused => {
                            other.state = FileState::Cancelled;
                            discard_partial(other);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Drops partial bytes of a cancelled file unless they can seed a resume.
fn discard_partial(file: &mut FileEntry) {
    if !file.spec.supports_resume && file.bytes_on_disk > 0 {
        let _ = fs::remove_file(&file.spec.dest);
        file.bytes_on_disk = 0;
    }
}
