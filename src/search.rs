// SPDX-License-Identifier: Apache-2.0

//! Work items exchanged by the two search stages and the contracts of the
//! external engines that produce them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::path_condition::PathCondition;
use crate::pathweave_error::CollaboratorError;
use crate::worker_pool::CancelToken;

/// A concrete test case, consumed by path resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    /// Opaque to this crate; interpreted by the collaborators only.
    pub payload: String,
    /// The target condition this test was generated for. Seed tests have
    /// none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generating_condition: Option<PathCondition>,
    #[serde(default)]
    pub depth: usize,
}

impl TestCase {
    pub fn seed(id: impl Into<String>, payload: impl Into<String>) -> Self {
        TestCase {
            id: id.into(),
            payload: payload.into(),
            generating_condition: None,
            depth: 0,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.generating_condition.is_none()
    }
}

/// A path condition a test generator should try to satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTarget {
    pub condition: PathCondition,
    pub depth: usize,
}

/// One path followed while executing a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub condition: PathCondition,
    pub feasible: bool,
    /// Alternative branch conditions reachable from this path.
    #[serde(default)]
    pub frontier: Vec<PathCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub id: String,
    pub payload: String,
    /// Must be one of the requested target conditions.
    pub target: PathCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    #[serde(default)]
    pub tests: Vec<GeneratedTest>,
    /// Identifiers of the branches the generated tests cover.
    #[serde(default)]
    pub covered: Vec<String>,
}

/// Executes a test symbolically and reports the paths it followed.
pub trait PathResolver: Send + Sync {
    fn resolve(
        &self,
        test: &TestCase,
        cancel: &CancelToken,
    ) -> Result<Vec<Resolution>, CollaboratorError>;
}

/// Searches for inputs that satisfy the given targets within `budget`.
pub trait TestGenerator: Send + Sync {
    fn generate(
        &self,
        targets: &[PathTarget],
        budget: Duration,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome, CollaboratorError>;
}
