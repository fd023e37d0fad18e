// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathweaveError {
    /// A constructor or configuration loader was handed parameters it cannot
    /// work with. Never retried.
    #[error("pathweave error: invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pathweave error: {performer}: cannot {operation} while {state}")]
    IllegalState {
        performer: String,
        operation: &'static str,
        state: &'static str,
    },

    #[error("pathweave error: failed to spawn thread {name}: {message}")]
    Spawn { name: String, message: String },
}

/// Failure reported by an external collaborator (path resolver, test
/// generator) while executing one job. Jobs log these and treat the batch as
/// having produced no output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    pub collaborator: String,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }
}
