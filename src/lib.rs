// SPDX-License-Identifier: Apache-2.0

//! Concurrent two-stage search framework with similarity-based triage.
//!
//! Two [`Performer`]s feed each other through [`Buffer`]s while a
//! [`TerminationManager`] watches for a global fixpoint or a timeout. The
//! [`ClassifierKnn`] summarizes path conditions as [`PathFingerprint`]s and
//! predicts which targets are not worth exploring.

pub mod buffer;
pub mod classifier;
pub mod fingerprint;
pub mod path_condition;
pub mod pathweave_error;
pub mod performer;
pub mod pipeline;
pub mod search;
pub mod termination;
pub mod worker_pool;

pub use buffer::{Buffer, FifoBuffer, PriorityBuffer};
pub use classifier::{ClassifierKnn, Prediction, TrainingItem, TriagePolicy};
pub use fingerprint::PathFingerprint;
pub use path_condition::{PathCondition, PathConditionSlicer, ShapeSlicer, SlicedCondition};
pub use pathweave_error::{CollaboratorError, PathweaveError};
pub use performer::{DispatchStats, Performer, PerformerConfig, PerformerState, Stage};
pub use pipeline::{
    CoverageLedger, GenerateStage, ResolveStage, SearchConfig, SearchContext, SearchCounts,
    SearchPipeline, SearchReport,
};
pub use search::{
    GeneratedTest, GenerationOutcome, PathResolver, PathTarget, Resolution, TestCase,
    TestGenerator,
};
pub use termination::{
    AbortHandle, Supervised, TerminationConfig, TerminationManager, TerminationReason,
};
pub use worker_pool::{CancelToken, WorkerPool};
