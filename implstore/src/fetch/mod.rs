// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fetcher: plans and performs the downloads that populate the store.
//!
//! For each requested implementation the fetcher skips work already done
//! (the store is content-addressed, so presence is completion), chooses a
//! retrieval method, downloads archives through the scheduler, and hands the
//! local files to the store for extraction and verify-and-install. At most
//! one fetch per digest is in flight at a time: concurrent callers of the
//! same digest await the winner's result instead of duplicating I/O.

use crate::{
    config::CoreConfig,
    download::{
        DownloadFile, DownloadJob, DownloadScheduler, HttpTransport, Priority, Transport,
    },
    errors::{AddError, DownloadError, FetchError},
    extract::ArchiveSource,
    manifest::ManifestDigest,
    store::DirectoryStore,
    task::{TaskHandler, TaskInfo},
};
use std::{
    collections::HashSet,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::debug;

/// A downloadable archive, as described by a feed.
#[derive(Clone, Debug)]
pub struct Archive {
    /// Absolute URL the bytes are served from.
    pub url: String,

    /// MIME type selecting the extractor.
    pub mime_type: String,

    /// Declared size of the archive proper, excluding any leading offset.
    pub size: u64,

    /// Leading non-archive bytes (self-extracting installers).
    pub start_offset: u64,

    /// Extract only this sub-directory of the archive, rerooted.
    pub sub_dir: Option<String>,
}

/// An ordered list of archives whose overlay produces the implementation.
#[derive(Clone, Debug)]
pub struct Recipe {
    /// The archives, in overlay order: later steps may overwrite earlier.
    pub steps: Vec<Archive>,
}

/// One implementation to fetch: its identity plus the ways to retrieve it.
#[derive(Clone, Debug)]
pub struct Implementation {
    /// The expected manifest digest; also the name installed under.
    pub digest: ManifestDigest,

    /// Direct single-archive retrieval methods.
    pub archives: Vec<Archive>,

    /// Recipe retrieval methods.
    pub recipes: Vec<Recipe>,
}

/// A top-level fetch call's input.
#[derive(Clone, Debug, Default)]
pub struct FetchRequest {
    /// The implementations to ensure are present in the store.
    pub implementations: Vec<Implementation>,
}

/// Source of parsed [`Implementation`] values, implemented by the feed
/// layer. The core never reads feed XML; this is the boundary it receives
/// solver output through.
pub trait FeedProvider {
    /// The implementations the caller wants present in the store.
    fn implementations(&self) -> Vec<Implementation>;
}

/// Fetches implementations into a [`DirectoryStore`].
pub struct Fetcher<'store> {
    store: &'store DirectoryStore,
    scheduler: DownloadScheduler,
    flights: FlightTable,
}

impl<'store> Fetcher<'store> {
    /// Creates a fetcher over the production HTTP transport.
    pub fn new(config: &CoreConfig, store: &'store DirectoryStore) -> Self {
        let transport = Arc::new(HttpTransport::new(config.downloads.network_timeout));
        Self::with_transport(config, store, transport)
    }

    /// Creates a fetcher over a custom transport (test seam).
    pub fn with_transport(
        config: &CoreConfig,
        store: &'store DirectoryStore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            scheduler: DownloadScheduler::new(&config.downloads, transport),
            flights: FlightTable::default(),
        }
    }

    /// Fetches every implementation in the request, in order.
    ///
    /// Fetching something already present is a no-op, so retrying a failed
    /// request re-downloads only what is still missing.
    pub fn fetch_all(
        &self,
        request: &FetchRequest,
        handler: &dyn TaskHandler,
    ) -> Result<(), FetchError> {
        let count = request.implementations.len();
        debug!(
            "fetching {count} {}",
            crate::helpers::plural::implementations_str(count)
        );
        for implementation in &request.implementations {
            self.fetch(implementation, handler)?;
        }
        Ok(())
    }

    /// Fetches everything a [`FeedProvider`] asks for.
    pub fn fetch_from(
        &self,
        provider: &dyn FeedProvider,
        handler: &dyn TaskHandler,
    ) -> Result<(), FetchError> {
        let request = FetchRequest {
            implementations: provider.implementations(),
        };
        self.fetch_all(&request, handler)
    }

    /// Ensures one implementation is present in the store.
    pub fn fetch(
        &self,
        implementation: &Implementation,
        handler: &dyn TaskHandler,
    ) -> Result<(), FetchError> {
        if handler.cancel_token().is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if self.store.contains(&implementation.digest) {
            debug!("{} already in store, skipping", implementation.digest);
            return Ok(());
        }
        let digest_id = implementation
            .digest
            .best_id()
            .ok_or(FetchError::NoKnownDigest)?;

        match self.flights.begin(&digest_id) {
            Flight::Leader(guard) => {
                // Re-check under leadership: a previous leader may have
                // installed this digest between our first check and now.
                if self.store.contains(&implementation.digest) {
                    return Ok(());
                }
                handler.run_task(&TaskInfo::new(&digest_id), "fetching implementation");
                let result = self.fetch_uncached(implementation, handler);
                drop(guard);
                result
            }
            Flight::Awaited => {
                // The winner has settled; presence is its result.
                if self.store.contains(&implementation.digest) {
                    Ok(())
                } else {
                    Err(FetchError::FlightFailed { digest: digest_id })
                }
            }
        }
    }

    fn fetch_uncached(
        &self,
        implementation: &Implementation,
        handler: &dyn TaskHandler,
    ) -> Result<(), FetchError> {
        let steps = select_method(implementation)?;

        // Download temp files live beside the store so the final rename
        // never crosses a filesystem boundary.
        let parent = self
            .store
            .root()
            .parent()
            .unwrap_or_else(|| self.store.root());
        let downloads = camino_tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(parent)
            .map_err(|error| {
                FetchError::Download(DownloadError::Io {
                    path: parent.to_owned(),
                    error,
                })
            })?;

        let files: Vec<DownloadFile> = steps
            .iter()
            .enumerate()
            .map(|(index, archive)| DownloadFile {
                url: archive.url.clone(),
                dest: downloads.path().join(format!("archive-{index}")),
                expected_size: archive.size,
                range_start: archive.start_offset,
                supports_resume: true,
            })
            .collect();
        let dests: Vec<_> = files.iter().map(|file| file.dest.clone()).collect();

        let job = self.scheduler.add_job(DownloadJob {
            priority: Priority::NORMAL,
            files,
        })?;
        let outcomes = self.wait_with_cancellation(job, handler)?;

        let sources: Vec<ArchiveSource<'_>> = steps
            .iter()
            .zip(&outcomes)
            .zip(&dests)
            .map(|((archive, outcome), dest)| ArchiveSource {
                path: dest,
                mime_type: &archive.mime_type,
                // A honoured range already stripped the prefix off the wire.
                start_offset: if outcome.range_honored {
                    0
                } else {
                    archive.start_offset
                },
                sub_dir: archive.sub_dir.as_deref(),
            })
            .collect();

        let installed = if let [source] = sources.as_slice() {
            self.store.add_archive(source, &implementation.digest, handler)
        } else {
            self.store
                .add_multiple_archives(&sources, &implementation.digest, handler)
        };
        match installed {
            Ok(_) => Ok(()),
            Err(AddError::AlreadyInStore { digest }) => {
                // A concurrent install won the rename race; same bytes.
                debug!("{digest} appeared while fetching, treating as success");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Waits for a job while bridging the handler's cancel token to job
    /// cancellation.
    fn wait_with_cancellation(
        &self,
        job: crate::download::JobId,
        handler: &dyn TaskHandler,
    ) -> Result<Vec<crate::download::FileOutcome>, FetchError> {
        let token = handler.cancel_token().clone();
        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let done = Arc::clone(&done);
            // The scheduler is a shared handle; give the watcher its own so
            // no borrow crosses the thread boundary.
            let scheduler = self.scheduler.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if token.is_cancelled() {
                        scheduler.remove_job(job);
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            })
        };

        let result = self.scheduler.wait(job);
        done.store(true, Ordering::Relaxed);
        let _ = watcher.join();

        if handler.cancel_token().is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        result.map_err(FetchError::from)
    }
}

/// Deterministic retrieval-method selection: the smallest direct archive
/// (ties by listed order), else the first recipe.
fn select_method(implementation: &Implementation) -> Result<Vec<&Archive>, FetchError> {
    if let Some(best) = implementation
        .archives
        .iter()
        .enumerate()
        .min_by_key(|(index, archive)| (archive.size, *index))
        .map(|(_, archive)| archive)
    {
        return Ok(vec![best]);
    }
    if let Some(recipe) = implementation.recipes.first() {
        if !recipe.steps.is_empty() {
            return Ok(recipe.steps.iter().collect());
        }
    }
    Err(FetchError::NoRetrievalMethod {
        digest: implementation
            .digest
            .best_id()
            .unwrap_or_else(|| "(no digest)".to_owned()),
    })
}

enum Flight<'table> {
    Leader(FlightGuard<'table>),
    Awaited,
}

/// Serializes fetches per digest: one leader performs I/O, everyone else
/// blocks until the leader settles.
#[derive(Default)]
struct FlightTable {
    in_flight: Mutex<HashSet<String>>,
    settled: Condvar,
}

impl FlightTable {
    /// The set is plain bookkeeping that stays consistent across a panicked
    /// holder, so a poisoned lock is recovered, not propagated.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, digest_id: &str) -> Flight<'_> {
        let mut in_flight = self.lock();
        if in_flight.insert(digest_id.to_owned()) {
            return Flight::Leader(FlightGuard {
                table: self,
                digest_id: digest_id.to_owned(),
            });
        }
        while in_flight.contains(digest_id) {
            in_flight = self
                .settled
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Flight::Awaited
    }
}

/// Removes the leader's entry on drop, so a panicking fetch never wedges
/// its digest.
struct FlightGuard<'table> {
    table: &'table FlightTable,
    digest_id: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.table.lock();
        in_flight.remove(&self.digest_id);
        self.table.settled.notify_all();
    }
}
