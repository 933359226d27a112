// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `accelschedd.toml` loading.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nexus_accel_sched::{SchedConfig, SchedError};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("scheduler request failed: {0}")]
    Sched(#[from] SchedError),
    #[error("{0}")]
    Usage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub sched: SchedConfig,
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { sched: SchedConfig::default(), log_filter: DEFAULT_LOG_FILTER.to_string() }
    }
}

impl DaemonConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("config: {} missing, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(DaemonError::Read { path: path.to_path_buf(), source }),
        };
        Self::parse(&data).map_err(|err| match err {
            ParseFailure::Toml(source) => DaemonError::Parse { path: path.to_path_buf(), source },
            ParseFailure::Invalid(err) => DaemonError::Sched(err),
        })
    }

    fn parse(data: &str) -> Result<Self, ParseFailure> {
        let cfg: Self = toml::from_str(data).map_err(ParseFailure::Toml)?;
        cfg.sched.validate().map_err(ParseFailure::Invalid)?;
        Ok(cfg)
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(SchedError),
}
