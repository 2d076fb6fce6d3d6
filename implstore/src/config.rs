// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Explicit configuration for the store and fetcher.
//!
//! There are no ambient singletons: callers construct a [`CoreConfig`] at
//! program start (from a TOML file or [`Default`]) and pass it down.

use crate::errors::ConfigParseError;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{fs, time::Duration};

/// Top-level configuration for the core.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Store root override. `None` leaves the choice to the caller.
    pub store_root: Option<Utf8PathBuf>,

    /// Download scheduler and transport settings.
    pub downloads: DownloadConfig,
}

impl CoreConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigParseError> {
        toml::from_str(text).map_err(|error| ConfigParseError::Parse { error })
    }

    /// Reads and parses a configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigParseError> {
        let text = fs::read_to_string(path).map_err(|error| ConfigParseError::Read {
            path: path.to_owned(),
            error,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Settings for the download scheduler and HTTP transport.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Soft cap on simultaneous transfers. Preempted-but-unpausable
    /// transfers may briefly exceed it.
    pub max_simultaneous: usize,

    /// Total attempts per file for transient network and I/O errors.
    pub max_attempts: u32,

    /// First retry delay; subsequent retries double it. No jitter, so test
    /// runs are deterministic.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Timeout applied to each HTTP request.
    #[serde(with = "humantime_serde")]
    pub network_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_simultaneous: 2,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            network_timeout: Duration::from_secs(30),
        }
    }
}
