//! Controller error kinds.
//!
//! Topology and store errors abort the mutation they occurred in and leave
//! the persisted snapshot untouched. Command failures are collected per
//! (source, destination) pair by the reconciler instead of being raised.

use std::path::PathBuf;

/// Errors surfaced by the topology controller
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("link {link_id} already exists")]
    DuplicateLink { link_id: String },

    #[error("link {link_id} not found")]
    LinkNotFound { link_id: String },

    #[error("node {node_id} not found")]
    UnknownNode { node_id: String },

    #[error("node {node_id} is still referenced by link {link_id}")]
    NodeInUse { node_id: String, link_id: String },

    #[error("state store {path:?} unavailable: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("command `{command}` failed on node {node_id}: {reason}")]
    CommandExecutionFailed {
        node_id: String,
        command: String,
        reason: String,
    },
}

impl ControllerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn store(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
