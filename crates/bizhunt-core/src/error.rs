//! Error taxonomy shared by adapters, the merge engine and the run coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FinancialKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Worth retrying: timeouts, 5xx, 429, dropped connections.
    Transient,
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => f.write_str("transient"),
            FetchErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Adapter-level failure to fetch or read one page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} fetch error for {url}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }

    /// Same error, reclassified once the retry budget is spent.
    pub fn into_permanent(mut self) -> Self {
        self.kind = FetchErrorKind::Permanent;
        self
    }
}

/// The normalizer could not interpret a non-empty financial string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not interpret {kind} text {raw:?}")]
pub struct ParseError {
    pub kind: FinancialKind,
    pub raw: String,
}

/// URL enumeration for a source failed; fails that source only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source {source_id} failed: {reason}")]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

impl SourceFailure {
    pub fn new(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("listing (de)serialization failed: {0}")]
    Serialization(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid listing url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("listing url {0:?} is not http(s)")]
    UnsupportedScheme(String),
}
