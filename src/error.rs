// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! This module defines the error types used throughout the replicator.
//! Errors are categorized by where in the protocol they occur and include
//! context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Recoverable | Description |
//! |------------|-------------|-------------|
//! | `NotFound` | Sometimes | Missing database or replication log; recovered only for target creation and absent logs |
//! | `Transport` | No | Network I/O error, timeout, or unexpected HTTP status |
//! | `Decode` | No | Malformed JSON or multipart response body |
//! | `Completed` | — | Normal terminal signal for a one-shot run with nothing left to do |
//! | `Aborted` | No | Cancellation observed |
//! | `Config` | No | Job configuration invalid (bad URL, bad header) |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Recovery Behavior
//!
//! The controller recovers `NotFound` in exactly two places: creating the
//! target when the job requests it, and treating an absent replication log
//! as empty. Every other classification aborts the run. Use
//! [`ReplicationError::is_not_found()`] and
//! [`ReplicationError::is_completed()`] to branch on the recoverable cases.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during a replication run.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// An expected resource is absent (database or `_local` log).
    ///
    /// Recovered only for target creation and missing replication logs.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Network I/O failure or a non-2xx status the protocol does not map.
    #[error("transport error ({operation}): {message}")]
    Transport {
        operation: String,
        status: Option<u16>,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Malformed response body (JSON or multipart framing).
    ///
    /// Not recoverable; the data is malformed at the peer.
    #[error("decode error: {0}")]
    Decode(String),

    /// A one-shot run observed an empty changes batch and has nothing
    /// further to do. Normal terminal signal, not a failure.
    #[error("replication completed")]
    Completed,

    /// Cancellation observed. No checkpoint is written.
    #[error("replication aborted")]
    Aborted,

    /// Invalid job configuration (unparsable URL, bad header bytes).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal error. Indicates a bug that needs investigation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a `NotFound` for a named resource.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a `Transport` error from a reqwest error.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            status: source.status().map(|s| s.as_u16()),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a `Transport` error for an unexpected HTTP status.
    pub fn transport_status(operation: impl Into<String>, status: u16) -> Self {
        Self::Transport {
            operation: operation.into(),
            status: Some(status),
            message: format!("unexpected status {status}"),
            source: None,
        }
    }

    /// Create a `Transport` error with a bare message.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Check if this is the recoverable not-found classification.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is the normal replication-completed signal.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if this is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport("request", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
