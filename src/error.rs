// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error and Result types for federation operations.

use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;

/// The error type shared by the router, codecs and storages.
#[derive(Debug, Error)]
pub enum FederationError {
    /// No declared storage window contains the key/timestamp being written.
    #[error("No storage declared for key '{id}' at {timestamp}")]
    NoStorageForKey {
        /// String identifier of the key.
        id: String,
        /// Timestamp of the entry that could not be routed.
        timestamp: DateTime<Utc>,
    },

    /// A single serialized entry does not fit into one blob.
    #[error("Entry of {size} bytes exceeds the blob limit of {max} bytes")]
    EntryTooLarge {
        /// Serialized size of the entry.
        size: usize,
        /// Configured maximum blob size.
        max: usize,
    },

    /// An optional collaborator was required but never configured.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Some storages of a write fan-out failed while others succeeded.
    #[error("Write failed on {failed} storage(s), succeeded on {succeeded}: {}", errors.join("; "))]
    PartialWriteFailure {
        /// Number of failed per-storage writes.
        failed: usize,
        /// Number of successful per-storage writes.
        succeeded: usize,
        /// Rendered per-storage errors.
        errors: Vec<String>,
    },

    /// A continuation token was used against a storage that cannot interpret it.
    #[error("Invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    /// Entry or blob (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl FederationError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FederationError::Io(_)
                | FederationError::Backend(_)
                | FederationError::PartialWriteFailure { .. }
        )
    }
}

impl From<prost::DecodeError> for FederationError {
    fn from(err: prost::DecodeError) -> Self {
        FederationError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FederationError::Io(io::Error::other("disk")).is_retryable());
        assert!(!FederationError::EntryTooLarge { size: 10, max: 5 }.is_retryable());
        assert!(!FederationError::MissingCollaborator("remote publish/subscribe").is_retryable());
    }

    #[test]
    fn test_partial_failure_message() {
        let err = FederationError::PartialWriteFailure {
            failed: 1,
            succeeded: 2,
            errors: vec!["hot: disk full".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("1 storage(s)"));
        assert!(message.contains("hot: disk full"));
    }
}
