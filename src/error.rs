//! Caller-facing error taxonomy.
//!
//! Configuration problems are collected into [`ConfigErrors`] and reported
//! together. Failures during a run are tagged with the step that caused them.
//! Cancellation is not an error: `Builder::run` returns `Ok(None)`.

use std::fmt;
use thiserror::Error;

use crate::driver::DriverError;

/// A single defect found while preparing a build.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid build spec: {0}")]
    Decode(String),

    #[error("unknown field in build spec: {0}")]
    UnknownField(String),

    #[error("{field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("due to large file sizes, an iso_checksum is required")]
    MissingChecksum,

    #[error("iso_checksum '{value}' is not a valid {kind} digest")]
    InvalidChecksum { kind: String, value: String },

    #[error("unsupported iso_checksum_type: {0} (expected md5, sha1, sha256 or sha512)")]
    UnknownChecksumType(String),

    #[error("an iso_url must be specified")]
    MissingIsoUrl,

    #[error("iso_url is not a valid URL: {0}")]
    InvalidIsoUrl(String),

    #[error("iso_url points to bad file '{path}': {reason}")]
    BadIsoFile { path: String, reason: String },

    #[error("unsupported URL scheme in iso_url: {0}")]
    UnsupportedScheme(String),

    #[error("disk_size must be greater than zero")]
    InvalidDiskSize,

    #[error("failed creating VirtualBox driver: {0}")]
    DriverUnavailable(#[source] DriverError),
}

/// Every defect found by one `prepare` pass.
#[derive(Debug)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for ConfigErrors {
    type Item = ConfigError;
    type IntoIter = std::vec::IntoIter<ConfigError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  * {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

/// Result of a build that did not produce an artifact for a reason other
/// than cancellation.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Configuration(ConfigErrors),

    #[error("builder has not been prepared")]
    NotPrepared,

    #[error("step '{step}' failed: {source:#}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },
}
