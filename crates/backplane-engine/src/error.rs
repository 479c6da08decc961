// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the workflow engine.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced while building or running a workflow.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// The definition could not be parsed or describes an invalid graph.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A node references a type with no registered executor.
    #[error("executor not found for node type '{node_type}'")]
    ExecutorNotFound {
        /// The unregistered node type.
        node_type: String,
    },

    /// A node failed after exhausting its retries.
    #[error("node '{node_id}' failed: {message}")]
    NodeFailed {
        /// The failing node.
        node_id: String,
        /// Failure detail reported by the executor.
        message: String,
    },

    /// The execution was cancelled before it finished.
    #[error("execution cancelled")]
    Cancelled,

    /// The execution exceeded its configured timeout.
    #[error("execution timeout after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },
}

impl EngineError {
    /// Shorthand for a node failure.
    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeFailed {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Stable code used in execution events and persisted execution rows.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::ExecutorNotFound { .. } => "EXECUTOR_NOT_FOUND",
            Self::NodeFailed { .. } => "NODE_FAILED",
            Self::Cancelled => "EXECUTION_CANCELLED",
            Self::Timeout { .. } => "EXECUTION_TIMEOUT",
        }
    }
}
