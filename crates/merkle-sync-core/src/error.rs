//! Error taxonomy shared by the client, the server, and the hash tree.
//!
//! | Variant | Surfaced to sync caller | Retried |
//! |---------|-------------------------|---------|
//! | [`SyncError::InvalidRequest`] | yes (400) | never |
//! | [`SyncError::Unauthorized`] | yes (401) | never |
//! | [`SyncError::EmptyInput`] | no (caller bug) | never |
//! | [`SyncError::UpstreamTimeout`] | no, degrades to a placeholder payload | never |
//! | [`SyncError::StorageUnavailable`] | no, degrades to over-transfer | puts only, bounded |

use thiserror::Error;

/// Errors produced by the sync protocol and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Malformed body, missing `projectId`/`merkleRoot`, or a fragment
    /// whose content does not match its claimed hash.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller could not be authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A hash tree was built from an empty leaf set.
    #[error("cannot build a hash tree from an empty leaf set")]
    EmptyInput,

    /// The fragment-processing backend did not answer in time.
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// The key-value backend could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl SyncError {
    /// Shorthand for [`SyncError::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        SyncError::InvalidRequest(message.into())
    }
}

/// Failure modes of credential verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("malformed credential")]
    Malformed,
    #[error("credential rejected")]
    Rejected,
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        SyncError::Unauthorized(err.to_string())
    }
}
