// SPDX-License-Identifier: Apache-2.0

//! A single pipeline stage: an input buffer, an output buffer, a worker pool,
//! and a dispatcher thread that turns input batches into pool jobs.
//!
//! The dispatcher only ever blocks in three places: parked while the
//! performer is paused, waiting on the pool for free slots (throttle), and
//! inside `Buffer::poll_batch`. The last two waits are cut into slices of at
//! most `INTERRUPT_SLICE`, so `pause` and `stop` are observed promptly even
//! with a long poll timeout. It does no stage work itself; each non-empty
//! batch becomes exactly one job that calls `Stage::run_batch`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::buffer::Buffer;
use crate::pathweave_error::PathweaveError;
use crate::worker_pool::{CancelToken, WorkerPool};

/// Longest stretch the dispatcher waits without re-checking its phase.
const INTERRUPT_SLICE: Duration = Duration::from_millis(10);

/// The work a performer runs for each dispatched batch.
///
/// Implementations own their failure handling: a collaborator error should
/// be logged and the batch treated as producing no output. A panic is caught
/// by the pool and does not affect the dispatcher.
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn run_batch(
        &self,
        batch: Vec<Self::Input>,
        output: &dyn Buffer<Self::Output>,
        cancel: &CancelToken,
    );

    /// Runs once on the dispatcher thread after it observes the stop request.
    fn on_stop(&self) {}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformerConfig {
    /// Number of worker threads in the pool.
    pub workers: usize,
    /// Maximum number of input items folded into one job.
    pub max_batch: usize,
    /// Fraction of `max_batch` worker slots that must be free before the
    /// dispatcher polls another batch. 0 never throttles, 1 waits for the
    /// whole batch worth of slots.
    pub throttle: f64,
    /// Per-item wait inside `poll_batch`, in milliseconds.
    pub poll_timeout_ms: u64,
}

impl Default for PerformerConfig {
    fn default() -> Self {
        PerformerConfig::with_workers(num_cpus::get().max(1))
    }
}

impl PerformerConfig {
    pub fn with_workers(workers: usize) -> Self {
        PerformerConfig {
            workers,
            max_batch: workers,
            throttle: 0.0,
            poll_timeout_ms: 100,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Number of free slots the dispatcher waits for before polling.
    pub fn required_slots(&self) -> usize {
        ((self.max_batch as f64) * self.throttle).ceil() as usize
    }

    pub fn validate(&self) -> Result<(), PathweaveError> {
        if self.workers == 0 {
            return Err(PathweaveError::InvalidConfig(
                "workers must be > 0".to_string(),
            ));
        }
        if self.max_batch == 0 {
            return Err(PathweaveError::InvalidConfig(
                "max_batch must be > 0".to_string(),
            ));
        }
        if !self.throttle.is_finite() || !(0.0..=1.0).contains(&self.throttle) {
            return Err(PathweaveError::InvalidConfig(format!(
                "throttle must be in [0, 1]; got {}",
                self.throttle
            )));
        }
        if self.required_slots() > self.workers {
            return Err(PathweaveError::InvalidConfig(format!(
                "max_batch {} with throttle {} requires {} free slots but the pool only has {}",
                self.max_batch,
                self.throttle,
                self.required_slots(),
                self.workers
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformerState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl PerformerState {
    fn as_str(self) -> &'static str {
        match self {
            PerformerState::Created => "created",
            PerformerState::Running => "running",
            PerformerState::Paused => "paused",
            PerformerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct ControlState {
    phase: PerformerState,
    dispatcher_alive: bool,
    dispatcher_parked: bool,
}

struct Control {
    state: Mutex<ControlState>,
    /// Dispatcher waits here while paused.
    resumed: Condvar,
    /// `pause()` waits here for the dispatcher to acknowledge.
    parked: Condvar,
}

impl Control {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Parks the dispatcher while paused. Returns false once stopped.
    fn wait_while_paused(&self) -> bool {
        let mut st = self.lock();
        loop {
            match st.phase {
                PerformerState::Stopped => return false,
                PerformerState::Paused => {
                    if !st.dispatcher_parked {
                        st.dispatcher_parked = true;
                        self.parked.notify_all();
                    }
                    st = self
                        .resumed
                        .wait(st)
                        .unwrap_or_else(|poison| poison.into_inner());
                }
                PerformerState::Created | PerformerState::Running => {
                    st.dispatcher_parked = false;
                    return true;
                }
            }
        }
    }

    /// False once a pause or stop has been requested.
    fn dispatching(&self) -> bool {
        matches!(
            self.lock().phase,
            PerformerState::Created | PerformerState::Running
        )
    }

    fn dispatcher_exited(&self) {
        let mut st = self.lock();
        st.dispatcher_alive = false;
        st.dispatcher_parked = false;
        self.parked.notify_all();
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    batches: AtomicU64,
    items: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub batches: u64,
    pub items: u64,
}

struct Inner<S: Stage> {
    name: String,
    stage: Arc<S>,
    input: Arc<dyn Buffer<S::Input>>,
    output: Arc<dyn Buffer<S::Output>>,
    pool: WorkerPool,
    config: PerformerConfig,
    control: Control,
    counters: DispatchCounters,
}

impl<S: Stage> Inner<S> {
    fn submit_batch(&self, batch: Vec<S::Input>) {
        let items = batch.len() as u64;
        let stage = Arc::clone(&self.stage);
        let output = Arc::clone(&self.output);
        let accepted = self.pool.submit(Box::new(move |cancel: &CancelToken| {
            stage.run_batch(batch, output.as_ref(), cancel);
        }));
        if accepted {
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters.items.fetch_add(items, Ordering::Relaxed);
            log::trace!("{}: dispatched batch of {} item(s)", self.name, items);
        } else {
            log::debug!(
                "{}: dropped batch of {} item(s); pool is shut down",
                self.name,
                items
            );
        }
    }

    /// `Buffer::poll_batch` in short slices. Gives up once a single item has
    /// been waited for `timeout` (rounded up to a slice), or as soon as a
    /// pause or stop is requested; a partial batch is still returned.
    fn poll_interruptible(&self, max: usize, timeout: Duration) -> Vec<S::Input> {
        let slice = timeout.min(INTERRUPT_SLICE);
        let mut batch = Vec::new();
        let mut item_deadline = Instant::now() + timeout;
        while batch.len() < max {
            let got = self.input.poll_batch(max - batch.len(), slice);
            if !got.is_empty() {
                batch.extend(got);
                item_deadline = Instant::now() + timeout;
                continue;
            }
            if Instant::now() >= item_deadline || !self.control.dispatching() {
                break;
            }
        }
        batch
    }

    fn dispatch_loop(&self, seed: Option<Vec<S::Input>>) {
        if let Some(seed) = seed {
            if !seed.is_empty() {
                log::debug!("{}: dispatching seed batch of {}", self.name, seed.len());
                self.submit_batch(seed);
            }
        }
        let max_batch = self.config.max_batch;
        let required = self.config.required_slots();
        let timeout = self.config.poll_timeout();
        while self.control.wait_while_paused() {
            if required > 0
                && self.pool.available() < required
                && !self.pool.wait_for_available(
                    required,
                    timeout.clamp(Duration::from_millis(1), INTERRUPT_SLICE),
                )
            {
                continue;
            }
            let batch = self.poll_interruptible(max_batch, timeout);
            if batch.is_empty() {
                if timeout.is_zero() {
                    std::thread::yield_now();
                }
                continue;
            }
            self.submit_batch(batch);
        }
        log::debug!("{}: dispatcher stopping", self.name);
        self.stage.on_stop();
        self.control.dispatcher_exited();
    }
}

pub struct Performer<S: Stage> {
    inner: Arc<Inner<S>>,
    seed: Mutex<Option<Vec<S::Input>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Stage> Performer<S> {
    pub fn new(
        name: &str,
        stage: Arc<S>,
        input: Arc<dyn Buffer<S::Input>>,
        output: Arc<dyn Buffer<S::Output>>,
        config: PerformerConfig,
    ) -> Result<Self, PathweaveError> {
        config.validate()?;
        let pool = WorkerPool::new(name, config.workers)?;
        Ok(Performer {
            inner: Arc::new(Inner {
                name: name.to_string(),
                stage,
                input,
                output,
                pool,
                config,
                control: Control {
                    state: Mutex::new(ControlState {
                        phase: PerformerState::Created,
                        dispatcher_alive: false,
                        dispatcher_parked: false,
                    }),
                    resumed: Condvar::new(),
                    parked: Condvar::new(),
                },
                counters: DispatchCounters::default(),
            }),
            seed: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PerformerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PerformerState {
        self.inner.control.lock().phase
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            batches: self.inner.counters.batches.load(Ordering::Relaxed),
            items: self.inner.counters.items.load(Ordering::Relaxed),
        }
    }

    fn illegal(&self, operation: &'static str, state: PerformerState) -> PathweaveError {
        PathweaveError::IllegalState {
            performer: self.inner.name.clone(),
            operation,
            state: state.as_str(),
        }
    }

    /// Supplies work dispatched as one job as soon as the performer starts,
    /// ahead of anything in the input buffer and without throttling. Only
    /// valid before `start`; repeated calls extend the seed batch.
    pub fn seed(&self, items: Vec<S::Input>) -> Result<(), PathweaveError> {
        let st = self.inner.control.lock();
        if st.phase != PerformerState::Created {
            return Err(self.illegal("seed", st.phase));
        }
        let mut seed = self.seed.lock().unwrap_or_else(|poison| poison.into_inner());
        seed.get_or_insert_with(Vec::new).extend(items);
        Ok(())
    }

    pub fn start(&self) -> Result<(), PathweaveError> {
        let mut st = self.inner.control.lock();
        if st.phase != PerformerState::Created {
            return Err(self.illegal("start", st.phase));
        }
        let seed = self
            .seed
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        let inner = Arc::clone(&self.inner);
        let thread_name = format!("{}-dispatcher", self.inner.name);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || inner.dispatch_loop(seed))
            .map_err(|e| PathweaveError::Spawn {
                name: thread_name,
                message: e.to_string(),
            })?;
        st.phase = PerformerState::Running;
        st.dispatcher_alive = true;
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(handle);
        log::info!(
            "{}: started with {} worker(s), max_batch={}, throttle={}",
            self.inner.name,
            self.inner.config.workers,
            self.inner.config.max_batch,
            self.inner.config.throttle
        );
        Ok(())
    }

    /// Freezes dispatch and worker starts. Returns once the dispatcher has
    /// parked, so that after this call no new job can be submitted or
    /// started until `resume`. Jobs already running keep running.
    pub fn pause(&self) -> Result<(), PathweaveError> {
        let mut st = self.inner.control.lock();
        match st.phase {
            PerformerState::Running => {}
            PerformerState::Paused => return Ok(()),
            other => return Err(self.illegal("pause", other)),
        }
        st.phase = PerformerState::Paused;
        self.inner.pool.pause();
        while st.dispatcher_alive && !st.dispatcher_parked {
            st = self
                .inner
                .control
                .parked
                .wait(st)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PathweaveError> {
        let mut st = self.inner.control.lock();
        if st.phase != PerformerState::Paused {
            return Err(self.illegal("resume", st.phase));
        }
        st.phase = PerformerState::Running;
        self.inner.pool.resume();
        self.inner.control.resumed.notify_all();
        Ok(())
    }

    /// Terminal transition: wakes and joins the dispatcher, then shuts the
    /// pool down (queued jobs are discarded, running jobs see cancellation).
    /// Idempotent. Must not race with `pause` on the same performer.
    pub fn stop(&self) {
        {
            let mut st = self.inner.control.lock();
            if st.phase == PerformerState::Stopped {
                return;
            }
            st.phase = PerformerState::Stopped;
            self.inner.control.resumed.notify_all();
        }
        self.inner.pool.resume();
        self.inner.pool.shutdown();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("{}: dispatcher thread panicked", self.inner.name);
            }
        }
        let stats = self.stats();
        log::info!(
            "{}: stopped after {} batch(es), {} item(s)",
            self.inner.name,
            stats.batches,
            stats.items
        );
    }

    /// Waits for worker threads to exit after `stop`.
    pub fn join_workers(&self) {
        self.inner.pool.join();
    }

    fn idle_predicate(&self, phase: PerformerState) -> bool {
        phase == PerformerState::Stopped
            || (self.inner.pool.is_idle() && self.inner.input.is_empty())
    }

    /// Racy snapshot: another stage may be about to feed this one.
    pub fn is_idle_approx(&self) -> bool {
        let phase = self.state();
        self.idle_predicate(phase)
    }

    /// Evaluates `check` under the control lock if dispatch is frozen, that
    /// is the performer is stopped, or paused with its dispatcher parked.
    fn when_frozen(&self, check: impl FnOnce(PerformerState) -> bool) -> Option<bool> {
        let st = self.inner.control.lock();
        let frozen = match st.phase {
            PerformerState::Stopped => true,
            PerformerState::Paused => st.dispatcher_parked || !st.dispatcher_alive,
            PerformerState::Created | PerformerState::Running => false,
        };
        frozen.then(|| check(st.phase))
    }

    /// The idle predicate evaluated while dispatch is frozen. `None` unless
    /// the performer is paused (and its dispatcher parked) or stopped.
    pub fn is_idle_exact(&self) -> Option<bool> {
        self.when_frozen(|phase| self.idle_predicate(phase))
    }

    /// Pool half of `is_idle_exact`. While frozen, only this performer's
    /// dispatcher can submit to its pool, so an idle answer stays true until
    /// `resume`.
    pub fn pool_idle_exact(&self) -> Option<bool> {
        self.when_frozen(|phase| phase == PerformerState::Stopped || self.inner.pool.is_idle())
    }

    /// Input half of `is_idle_exact`. Only stable once every producer feeding
    /// this input is known to be idle.
    pub fn input_empty_exact(&self) -> Option<bool> {
        self.when_frozen(|phase| phase == PerformerState::Stopped || self.inner.input.is_empty())
    }

    #[cfg(test)]
    fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }
}

impl<S: Stage> Drop for Performer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
