// SPDX-License-Identifier: Apache-2.0

//! The search loop: a path-resolution stage and a test-generation stage fed
//! back to back, with classifier triage on every path target that flows
//! between them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::buffer::{Buffer, FifoBuffer, PriorityBuffer};
use crate::classifier::{ClassifierKnn, TrainingItem, TriagePolicy};
use crate::fingerprint::PathFingerprint;
use crate::path_condition::{PathCondition, PathConditionSlicer, ShapeSlicer};
use crate::pathweave_error::PathweaveError;
use crate::performer::{DispatchStats, Performer, PerformerConfig, Stage};
use crate::search::{PathResolver, PathTarget, TestCase, TestGenerator};
use crate::termination::{
    AbortHandle, Supervised, TerminationConfig, TerminationManager, TerminationReason,
};
use crate::worker_pool::CancelToken;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub resolve: PerformerConfig,
    pub generate: PerformerConfig,
    pub termination: TerminationConfig,
    pub triage: TriagePolicy,
    /// Targets deeper than this many resolve/generate rounds are dropped.
    pub max_depth: usize,
    /// Time budget handed to the generator for each batch, in milliseconds.
    pub generation_budget_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            resolve: PerformerConfig::default(),
            generate: PerformerConfig::default(),
            termination: TerminationConfig::default(),
            triage: TriagePolicy::default(),
            max_depth: 32,
            generation_budget_ms: 5_000,
        }
    }
}

impl SearchConfig {
    pub fn generation_budget(&self) -> Duration {
        Duration::from_millis(self.generation_budget_ms)
    }

    pub fn validate(&self) -> Result<(), PathweaveError> {
        self.resolve.validate()?;
        self.generate.validate()?;
        self.termination.validate()?;
        self.triage.validate()?;
        if self.max_depth == 0 {
            return Err(PathweaveError::InvalidConfig(
                "max_depth must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Union of the branch identifiers covered so far.
#[derive(Debug, Default)]
pub struct CoverageLedger {
    covered: Mutex<BTreeSet<String>>,
}

impl CoverageLedger {
    /// Returns how many of `branches` were not covered before.
    pub fn merge(&self, branches: impl IntoIterator<Item = String>) -> usize {
        let mut covered = self
            .covered
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        branches
            .into_iter()
            .filter(|b| covered.insert(b.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.covered
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.covered
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct SearchCounters {
    tests_resolved: AtomicU64,
    resolutions: AtomicU64,
    targets_emitted: AtomicU64,
    targets_skipped: AtomicU64,
    duplicate_targets: AtomicU64,
    depth_dropped: AtomicU64,
    tests_generated: AtomicU64,
    collaborator_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchCounts {
    pub tests_resolved: u64,
    pub resolutions: u64,
    pub targets_emitted: u64,
    /// Targets dropped because the classifier predicted them infeasible.
    pub targets_skipped: u64,
    pub duplicate_targets: u64,
    pub depth_dropped: u64,
    pub tests_generated: u64,
    pub collaborator_failures: u64,
}

impl SearchCounters {
    fn snapshot(&self) -> SearchCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SearchCounts {
            tests_resolved: load(&self.tests_resolved),
            resolutions: load(&self.resolutions),
            targets_emitted: load(&self.targets_emitted),
            targets_skipped: load(&self.targets_skipped),
            duplicate_targets: load(&self.duplicate_targets),
            depth_dropped: load(&self.depth_dropped),
            tests_generated: load(&self.tests_generated),
            collaborator_failures: load(&self.collaborator_failures),
        }
    }
}

/// State shared by both stages.
pub struct SearchContext {
    classifier: ClassifierKnn,
    slicer: Arc<dyn PathConditionSlicer>,
    policy: TriagePolicy,
    max_depth: usize,
    visited: Mutex<HashSet<PathCondition>>,
    coverage: CoverageLedger,
    generated: Mutex<Vec<TestCase>>,
    counters: SearchCounters,
}

impl SearchContext {
    pub fn new(
        policy: TriagePolicy,
        max_depth: usize,
        slicer: Arc<dyn PathConditionSlicer>,
    ) -> Result<Self, PathweaveError> {
        policy.validate()?;
        Ok(SearchContext {
            classifier: ClassifierKnn::new(policy.k)?,
            slicer,
            policy,
            max_depth,
            visited: Mutex::new(HashSet::new()),
            coverage: CoverageLedger::default(),
            generated: Mutex::new(Vec::new()),
            counters: SearchCounters::default(),
        })
    }

    pub fn classifier(&self) -> &ClassifierKnn {
        &self.classifier
    }

    pub fn coverage(&self) -> &CoverageLedger {
        &self.coverage
    }

    pub fn counts(&self) -> SearchCounts {
        self.counters.snapshot()
    }

    fn fingerprint(&self, condition: &PathCondition) -> Option<PathFingerprint> {
        match PathFingerprint::new(condition, self.slicer.as_ref()) {
            Ok(fp) => Some(fp),
            Err(e) => {
                log::warn!("triage: cannot fingerprint `{}`: {}", condition, e);
                None
            }
        }
    }

    /// True when the classifier is confident `condition` is infeasible.
    pub fn should_skip(&self, condition: &PathCondition) -> bool {
        if !self.policy.enabled {
            return false;
        }
        let Some(fp) = self.fingerprint(condition) else {
            return false;
        };
        let prediction = self.classifier.classify(&fp);
        let skip = self.policy.should_skip(&prediction);
        if skip {
            log::debug!("triage: skipping `{}` ({:?})", condition, prediction);
        }
        skip
    }

    /// Records `condition` as seen; false if it was seen before.
    fn first_visit(&self, condition: &PathCondition) -> bool {
        self.visited
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(condition.clone())
    }
}

/// Resolves tests into followed paths, learns from them, and emits the
/// untried frontier as targets.
pub struct ResolveStage {
    context: Arc<SearchContext>,
    resolver: Arc<dyn PathResolver>,
}

impl ResolveStage {
    pub fn new(context: Arc<SearchContext>, resolver: Arc<dyn PathResolver>) -> Self {
        ResolveStage { context, resolver }
    }

    fn resolve_one(&self, test: TestCase, output: &dyn Buffer<PathTarget>, cancel: &CancelToken) {
        let ctx = &self.context;
        // Judged before training on this test's own resolutions.
        let expand = match &test.generating_condition {
            Some(condition) => !ctx.should_skip(condition),
            None => true,
        };
        let resolutions = match self.resolver.resolve(&test, cancel) {
            Ok(resolutions) => resolutions,
            Err(e) => {
                log::warn!("resolve: test {}: {}", test.id, e);
                bump(&ctx.counters.collaborator_failures, 1);
                return;
            }
        };
        bump(&ctx.counters.tests_resolved, 1);
        bump(&ctx.counters.resolutions, resolutions.len());

        let training: Vec<TrainingItem> = resolutions
            .iter()
            .filter_map(|r| {
                ctx.fingerprint(&r.condition)
                    .map(|fp| TrainingItem::new(fp, r.feasible))
            })
            .collect();
        ctx.classifier.train(training);
        for r in &resolutions {
            ctx.first_visit(&r.condition);
        }

        if !expand {
            log::debug!(
                "resolve: not expanding test {}; its target looks infeasible",
                test.id
            );
            return;
        }
        let depth = test.depth + 1;
        for frontier in resolutions.into_iter().flat_map(|r| r.frontier) {
            if !ctx.first_visit(&frontier) {
                bump(&ctx.counters.duplicate_targets, 1);
                continue;
            }
            if depth > ctx.max_depth {
                bump(&ctx.counters.depth_dropped, 1);
                continue;
            }
            if ctx.should_skip(&frontier) {
                bump(&ctx.counters.targets_skipped, 1);
                continue;
            }
            output.add(PathTarget {
                condition: frontier,
                depth,
            });
            bump(&ctx.counters.targets_emitted, 1);
        }
    }
}

impl Stage for ResolveStage {
    type Input = TestCase;
    type Output = PathTarget;

    fn run_batch(&self, batch: Vec<TestCase>, output: &dyn Buffer<PathTarget>, cancel: &CancelToken) {
        for test in batch {
            if cancel.is_cancelled() {
                return;
            }
            self.resolve_one(test, output, cancel);
        }
    }

    fn on_stop(&self) {
        log::info!(
            "resolve: {} training item(s) collected",
            self.context.classifier.len()
        );
    }
}

/// Hands surviving targets to the test generator and feeds the generated
/// tests back to resolution.
pub struct GenerateStage {
    context: Arc<SearchContext>,
    generator: Arc<dyn TestGenerator>,
    budget: Duration,
}

impl GenerateStage {
    pub fn new(
        context: Arc<SearchContext>,
        generator: Arc<dyn TestGenerator>,
        budget: Duration,
    ) -> Self {
        GenerateStage {
            context,
            generator,
            budget,
        }
    }
}

impl Stage for GenerateStage {
    type Input = PathTarget;
    type Output = TestCase;

    fn run_batch(&self, batch: Vec<PathTarget>, output: &dyn Buffer<TestCase>, cancel: &CancelToken) {
        let ctx = &self.context;
        // The classifier may have learned more since these were emitted.
        let targets: Vec<PathTarget> = batch
            .into_iter()
            .filter(|t| {
                let skip = ctx.should_skip(&t.condition);
                if skip {
                    bump(&ctx.counters.targets_skipped, 1);
                }
                !skip
            })
            .collect();
        if targets.is_empty() || cancel.is_cancelled() {
            return;
        }
        let outcome = match self.generator.generate(&targets, self.budget, cancel) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("generate: batch of {} target(s): {}", targets.len(), e);
                bump(&ctx.counters.collaborator_failures, 1);
                return;
            }
        };
        let newly_covered = ctx.coverage.merge(outcome.covered);
        log::debug!(
            "generate: {} test(s) for {} target(s), {} new branch(es)",
            outcome.tests.len(),
            targets.len(),
            newly_covered
        );

        let depths: HashMap<&PathCondition, usize> =
            targets.iter().map(|t| (&t.condition, t.depth)).collect();
        let mut generated = Vec::with_capacity(outcome.tests.len());
        for test in outcome.tests {
            let Some(&depth) = depths.get(&test.target) else {
                log::warn!(
                    "generate: test {} names target `{}` which was not requested; dropping",
                    test.id,
                    test.target
                );
                continue;
            };
            generated.push(TestCase {
                id: test.id,
                payload: test.payload,
                generating_condition: Some(test.target),
                depth,
            });
        }
        bump(&ctx.counters.tests_generated, generated.len());
        ctx.generated
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .extend(generated.iter().cloned());
        for test in generated {
            output.add(test);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchReport {
    pub reason: TerminationReason,
    pub elapsed: Duration,
    pub counts: SearchCounts,
    pub resolve_dispatch: DispatchStats,
    pub generate_dispatch: DispatchStats,
    pub covered: Vec<String>,
    pub training_items: usize,
    /// Every generated test, in the order they were produced.
    pub tests: Vec<TestCase>,
}

impl std::fmt::Display for SearchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} after {:.1}s: {} test(s) generated, {} branch(es) covered, \
             {} target(s) emitted, {} skipped by triage, {} training item(s), \
             {} collaborator failure(s)",
            self.reason,
            self.elapsed.as_secs_f64(),
            self.counts.tests_generated,
            self.covered.len(),
            self.counts.targets_emitted,
            self.counts.targets_skipped,
            self.training_items,
            self.counts.collaborator_failures
        )
    }
}

/// Both stages, their buffers, and the termination manager watching them.
/// Runs once.
pub struct SearchPipeline {
    context: Arc<SearchContext>,
    resolve_input: Arc<PriorityBuffer<TestCase>>,
    resolve: Arc<Performer<ResolveStage>>,
    generate: Arc<Performer<GenerateStage>>,
    termination: TerminationManager,
    ran: AtomicBool,
}

impl SearchPipeline {
    pub fn new(
        config: SearchConfig,
        resolver: Arc<dyn PathResolver>,
        generator: Arc<dyn TestGenerator>,
    ) -> Result<Self, PathweaveError> {
        Self::with_slicer(config, resolver, generator, Arc::new(ShapeSlicer))
    }

    pub fn with_slicer(
        config: SearchConfig,
        resolver: Arc<dyn PathResolver>,
        generator: Arc<dyn TestGenerator>,
        slicer: Arc<dyn PathConditionSlicer>,
    ) -> Result<Self, PathweaveError> {
        config.validate()?;
        let context = Arc::new(SearchContext::new(
            config.triage.clone(),
            config.max_depth,
            slicer,
        )?);
        // Seeds go first so the classifier has ground truth early.
        let resolve_input = Arc::new(PriorityBuffer::new(TestCase::is_seed));
        let generate_input: Arc<FifoBuffer<PathTarget>> = Arc::new(FifoBuffer::new());

        let resolve = Arc::new(Performer::new(
            "resolve",
            Arc::new(ResolveStage::new(Arc::clone(&context), resolver)),
            resolve_input.clone() as Arc<dyn Buffer<TestCase>>,
            generate_input.clone() as Arc<dyn Buffer<PathTarget>>,
            config.resolve.clone(),
        )?);
        let generate = Arc::new(Performer::new(
            "generate",
            Arc::new(GenerateStage::new(
                Arc::clone(&context),
                generator,
                config.generation_budget(),
            )),
            generate_input as Arc<dyn Buffer<PathTarget>>,
            resolve_input.clone() as Arc<dyn Buffer<TestCase>>,
            config.generate.clone(),
        )?);
        let termination = TerminationManager::new(
            vec![
                resolve.clone() as Arc<dyn Supervised>,
                generate.clone() as Arc<dyn Supervised>,
            ],
            config.termination.clone(),
        )?;
        Ok(SearchPipeline {
            context,
            resolve_input,
            resolve,
            generate,
            termination,
            ran: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &SearchContext {
        &self.context
    }

    /// Lets another thread (a signal handler, say) end the search early.
    pub fn abort_handle(&self) -> AbortHandle {
        self.termination.abort_handle()
    }

    /// Feeds `seeds` to path resolution and blocks until the search reaches
    /// a fixpoint, times out, or is aborted.
    pub fn run(&self, seeds: Vec<TestCase>) -> Result<SearchReport, PathweaveError> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(PathweaveError::IllegalState {
                performer: "search".to_string(),
                operation: "run",
                state: "finished",
            });
        }
        let started = Instant::now();
        log::info!("search: starting from {} seed test(s)", seeds.len());
        for seed in seeds {
            self.resolve_input.add(seed);
        }
        if let Err(e) = self.start_all() {
            self.resolve.stop();
            self.generate.stop();
            return Err(e);
        }
        let reason = self.termination.wait_termination();
        self.resolve.join_workers();
        self.generate.join_workers();

        let report = SearchReport {
            reason,
            elapsed: started.elapsed(),
            counts: self.context.counts(),
            resolve_dispatch: self.resolve.stats(),
            generate_dispatch: self.generate.stats(),
            covered: self.context.coverage.snapshot(),
            training_items: self.context.classifier.len(),
            tests: self
                .context
                .generated
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .clone(),
        };
        log::info!("search: {}", report);
        Ok(report)
    }

    fn start_all(&self) -> Result<(), PathweaveError> {
        self.resolve.start()?;
        self.generate.start()?;
        self.termination.start()
    }
}
