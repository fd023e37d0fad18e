// SPDX-License-Identifier: Apache-2.0

//! End-to-end searches through the public API with in-process collaborators.

use std::sync::Arc;
use std::time::Duration;

use pathweave::{
    CancelToken, CollaboratorError, GeneratedTest, GenerationOutcome, PathCondition, PathResolver,
    PathTarget, PerformerConfig, Resolution, SearchConfig, SearchPipeline, TerminationConfig,
    TerminationReason, TestCase, TestGenerator, TriagePolicy,
};

const CHAIN_LENGTH: usize = 40;

fn pc(clause: String) -> PathCondition {
    PathCondition::new(vec![clause])
}

/// A program shaped like a ladder: step `i` opens the next live step and a
/// dead branch that turns out infeasible once a test for it is resolved.
struct Ladder;

impl PathResolver for Ladder {
    fn resolve(
        &self,
        test: &TestCase,
        _cancel: &CancelToken,
    ) -> Result<Vec<Resolution>, CollaboratorError> {
        if let Some(dead) = test.payload.strip_prefix("dead:") {
            return Ok(vec![Resolution {
                condition: pc(dead.to_string()),
                feasible: false,
                frontier: Vec::new(),
            }]);
        }
        let step: usize = test
            .payload
            .parse()
            .map_err(|_| CollaboratorError::new("ladder", "bad payload"))?;
        let mut frontier = Vec::new();
        if step < CHAIN_LENGTH {
            frontier.push(pc(format!("live{}(x)", step + 1)));
            frontier.push(pc(format!("d.f{} == {}", step, step)));
        }
        Ok(vec![Resolution {
            condition: pc(format!("live{}(x)", step)),
            feasible: true,
            frontier,
        }])
    }
}

impl TestGenerator for Ladder {
    fn generate(
        &self,
        targets: &[PathTarget],
        _budget: Duration,
        _cancel: &CancelToken,
    ) -> Result<GenerationOutcome, CollaboratorError> {
        let tests = targets
            .iter()
            .map(|t| {
                let clause = &t.condition.clauses()[0];
                let payload = match clause
                    .strip_prefix("live")
                    .and_then(|rest| rest.strip_suffix("(x)"))
                {
                    Some(step) => step.to_string(),
                    None => format!("dead:{}", clause),
                };
                GeneratedTest {
                    id: format!("t-{}", payload),
                    payload,
                    target: t.condition.clone(),
                }
            })
            .collect();
        Ok(GenerationOutcome {
            tests,
            covered: Vec::new(),
        })
    }
}

fn config(triage_enabled: bool) -> SearchConfig {
    let stage = PerformerConfig {
        workers: 2,
        max_batch: 1,
        throttle: 0.0,
        poll_timeout_ms: 5,
    };
    SearchConfig {
        resolve: stage.clone(),
        generate: stage,
        termination: TerminationConfig {
            timeout_secs: 60,
            check_interval_ms: 20,
        },
        triage: TriagePolicy {
            enabled: triage_enabled,
            k: 3,
            max_minority_votes: 0,
            min_average_similarity: 0.2,
        },
        max_depth: 2 * CHAIN_LENGTH,
        generation_budget_ms: 100,
    }
}

fn run(triage_enabled: bool) -> pathweave::SearchReport {
    let _ = env_logger::builder().is_test(true).try_init();
    let ladder = Arc::new(Ladder);
    let pipeline = SearchPipeline::new(config(triage_enabled), ladder.clone(), ladder).unwrap();
    pipeline.run(vec![TestCase::seed("seed", "0")]).unwrap()
}

#[test]
fn without_triage_every_dead_branch_is_tried() {
    let report = run(false);
    assert_eq!(report.reason, TerminationReason::Fixpoint);
    assert_eq!(report.counts.targets_skipped, 0);
    assert_eq!(report.counts.targets_emitted as usize, 2 * CHAIN_LENGTH);
    assert_eq!(report.counts.tests_generated as usize, 2 * CHAIN_LENGTH);
}

#[test]
fn triage_prunes_dead_branches_once_it_has_learned_them() {
    let report = run(true);
    assert_eq!(report.reason, TerminationReason::Fixpoint);
    assert!(report.counts.targets_skipped > 0, "{:?}", report.counts);
    // Live steps are never mistaken for dead ones.
    let live_tests = report
        .tests
        .iter()
        .filter(|t| !t.payload.starts_with("dead:"))
        .count();
    assert_eq!(live_tests, CHAIN_LENGTH);
    assert!(report.tests.len() < 2 * CHAIN_LENGTH);
}
