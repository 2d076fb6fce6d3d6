// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A content-addressed implementation store with verifiable manifests, and
//! the fetcher that populates it.
//!
//! An *implementation* is an immutable directory tree identified by the
//! digest of its canonical [manifest](crate::manifest). The
//! [store](crate::store) keeps each installed tree under its digest string,
//! staging all mutations and committing them with a single atomic rename;
//! the [fetcher](crate::fetch) acquires missing implementations over HTTP
//! (ranged and resumable, via the [download](crate::download) scheduler),
//! extracts them with the [extractors](crate::extract), and installs them
//! only after the recomputed digest matches the expected one.

pub mod config;
pub mod download;
pub mod errors;
pub mod extract;
pub mod fetch;
mod helpers;
pub mod manifest;
mod sidecar;
pub mod store;
pub mod task;

pub use sidecar::{SYMLINK_FILE_NAME, XBIT_FILE_NAME};
