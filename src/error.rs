//! Error types for the Ratewarden engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed policy or engine configuration, rejected at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// The governing policy's budget is exhausted for the current window
    #[error("Rate limit exceeded, window resets at {reset_time}")]
    LimitExceeded { reset_time: DateTime<Utc> },

    /// The counter store could not be reached or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is an expected denial rather than a fault.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Error::LimitExceeded { .. })
    }

    /// The retry hint carried by a denial.
    ///
    /// Faults carry no meaningful reset time and return `None`.
    pub fn reset_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::LimitExceeded { reset_time } => Some(*reset_time),
            _ => None,
        }
    }

    /// Short, stable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::LimitExceeded { .. } => "limit_exceeded",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, Error>;
