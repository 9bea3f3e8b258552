// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for parley-core operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors that can occur in parley-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not authenticated\n  hint: sign in before syncing conversations")]
    NotAuthenticated,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailure(String),

    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("cache entry unusable: {0}")]
    CacheCorrupt(String),

    #[error("membership change rejected: {0}")]
    MembershipConstraintViolation(String),

    #[error("duplicate pending send: {0}")]
    DuplicatePending(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the user-facing category of this error, if it is one that
    /// gets surfaced.
    ///
    /// Cache corruption and internal failures have no kind: they are
    /// recovered locally and never shown.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::NotAuthenticated => Some(ErrorKind::NotAuthenticated),
            Error::NetworkUnavailable(_) => Some(ErrorKind::NetworkUnavailable),
            Error::SubscriptionFailure(_) => Some(ErrorKind::SubscriptionFailure),
            Error::SendFailure(_) => Some(ErrorKind::SendFailure),
            Error::MembershipConstraintViolation(_) => {
                Some(ErrorKind::MembershipConstraintViolation)
            }
            _ => None,
        }
    }
}

/// Categories of errors that are shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthenticated,
    NetworkUnavailable,
    SubscriptionFailure,
    SendFailure,
    MembershipConstraintViolation,
}

impl ErrorKind {
    /// Returns the string representation used in logs and the wire protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotAuthenticated => "not_authenticated",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::SubscriptionFailure => "subscription_failure",
            ErrorKind::SendFailure => "send_failure",
            ErrorKind::MembershipConstraintViolation => "membership_constraint_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A specialized Result type for parley-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
