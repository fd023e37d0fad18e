// SPDX-License-Identifier: Apache-2.0

//! Global termination for a set of mutually feeding performers.
//!
//! Two watcher threads cooperate. The timeout watcher enforces the global
//! time budget. The quiescence watcher looks for a fixpoint: a racy idle
//! snapshot is only a hint, and is confirmed by pausing every performer and
//! re-evaluating the idle predicate while dispatch is frozen everywhere.
//! Pausing does not stop jobs that are already running, so the check runs in
//! two passes: first every pool must be idle, then every input must be
//! empty. A performer can only receive work from another performer's jobs,
//! so once all pools are idle and paused the inputs can no longer change.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;

use crate::pathweave_error::PathweaveError;
use crate::performer::{Performer, Stage};

/// The control surface the termination manager needs from a performer.
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;
    fn pause(&self) -> Result<(), PathweaveError>;
    fn resume(&self) -> Result<(), PathweaveError>;
    fn stop(&self);
    fn is_idle_approx(&self) -> bool;
    fn is_idle_exact(&self) -> Option<bool>;
    fn pool_idle_exact(&self) -> Option<bool>;
    fn input_empty_exact(&self) -> Option<bool>;
}

impl<S: Stage> Supervised for Performer<S> {
    fn name(&self) -> &str {
        Performer::name(self)
    }

    fn pause(&self) -> Result<(), PathweaveError> {
        Performer::pause(self)
    }

    fn resume(&self) -> Result<(), PathweaveError> {
        Performer::resume(self)
    }

    fn stop(&self) {
        Performer::stop(self)
    }

    fn is_idle_approx(&self) -> bool {
        Performer::is_idle_approx(self)
    }

    fn is_idle_exact(&self) -> Option<bool> {
        Performer::is_idle_exact(self)
    }

    fn pool_idle_exact(&self) -> Option<bool> {
        Performer::pool_idle_exact(self)
    }

    fn input_empty_exact(&self) -> Option<bool> {
        Performer::input_empty_exact(self)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerminationConfig {
    /// Global time budget for the whole search, in seconds.
    pub timeout_secs: u64,
    /// Cadence of the quiescence check, in milliseconds.
    pub check_interval_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        TerminationConfig {
            timeout_secs: 600,
            check_interval_ms: 1_000,
        }
    }
}

impl TerminationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PathweaveError> {
        if self.check_interval_ms == 0 {
            return Err(PathweaveError::InvalidConfig(
                "check_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Every performer was confirmed idle at the same time.
    Fixpoint,
    /// The global time budget ran out.
    TimedOut,
    /// `abort` was called.
    Aborted,
}

const PENDING: u8 = 0;
const TIMED_OUT: u8 = 1;
const ABORTED: u8 = 2;

/// Cloneable handle that asks a running termination manager to stop every
/// performer as soon as possible.
#[derive(Clone)]
pub struct AbortHandle {
    verdict: Arc<AtomicU8>,
    wake: Sender<()>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if self
            .verdict
            .compare_exchange(PENDING, ABORTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::info!("termination: abort requested");
        }
        let _ = self.wake.try_send(());
    }
}

pub struct TerminationManager {
    performers: Arc<Vec<Arc<dyn Supervised>>>,
    config: TerminationConfig,
    verdict: Arc<AtomicU8>,
    /// Wakes the quiescence watcher early (timeout or abort).
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    quiescence: Mutex<Option<JoinHandle<TerminationReason>>>,
    timeout: Mutex<Option<JoinHandle<()>>>,
}

impl TerminationManager {
    pub fn new(
        performers: Vec<Arc<dyn Supervised>>,
        config: TerminationConfig,
    ) -> Result<Self, PathweaveError> {
        config.validate()?;
        if performers.is_empty() {
            return Err(PathweaveError::InvalidConfig(
                "termination manager needs at least one performer".to_string(),
            ));
        }
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Ok(TerminationManager {
            performers: Arc::new(performers),
            config,
            verdict: Arc::new(AtomicU8::new(PENDING)),
            wake_tx,
            wake_rx,
            quiescence: Mutex::new(None),
            timeout: Mutex::new(None),
        })
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            verdict: Arc::clone(&self.verdict),
            wake: self.wake_tx.clone(),
        }
    }

    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    /// Spawns the timeout and quiescence watchers.
    pub fn start(&self) -> Result<(), PathweaveError> {
        let mut quiescence = self
            .quiescence
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if quiescence.is_some() {
            return Err(PathweaveError::IllegalState {
                performer: "termination manager".to_string(),
                operation: "start",
                state: "started",
            });
        }

        // Nothing is ever sent on this channel; the timeout watcher is
        // interrupted when the quiescence watcher drops the sender.
        let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded::<()>(0);
        let timeout_handle = {
            let verdict = Arc::clone(&self.verdict);
            let wake = self.wake_tx.clone();
            let budget = self.config.timeout();
            spawn_named("termination-timeout", move || {
                timeout_watcher(budget, interrupt_rx, verdict, wake)
            })?
        };

        let quiescence_handle = {
            let performers = Arc::clone(&self.performers);
            let verdict = Arc::clone(&self.verdict);
            let wake_rx = self.wake_rx.clone();
            let interval = self.config.check_interval();
            spawn_named("termination-quiescence", move || {
                let reason = quiescence_watcher(&performers, interval, &verdict, &wake_rx);
                // Ends the timeout watcher's wait.
                drop(interrupt_tx);
                reason
            })?
        };

        *self
            .timeout
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(timeout_handle);
        *quiescence = Some(quiescence_handle);
        log::info!(
            "termination: watching {} performer(s), timeout {:?}, check interval {:?}",
            self.performers.len(),
            self.config.timeout(),
            self.config.check_interval()
        );
        Ok(())
    }

    /// Blocks until the quiescence watcher has stopped every performer and
    /// exited. Returns immediately with `Aborted` if the manager was never
    /// started.
    pub fn wait_termination(&self) -> TerminationReason {
        let handle = self
            .quiescence
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        let reason = match handle {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::warn!("termination: quiescence watcher panicked; stopping performers");
                stop_all(&self.performers);
                TerminationReason::Aborted
            }),
            None => TerminationReason::Aborted,
        };
        let timeout = self
            .timeout
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(timeout) = timeout {
            let _ = timeout.join();
        }
        reason
    }
}

fn spawn_named<T: Send + 'static>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<JoinHandle<T>, PathweaveError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| PathweaveError::Spawn {
            name: name.to_string(),
            message: e.to_string(),
        })
}

fn timeout_watcher(
    budget: Duration,
    interrupt: Receiver<()>,
    verdict: Arc<AtomicU8>,
    wake: Sender<()>,
) {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match interrupt.recv_timeout(remaining) {
            Err(RecvTimeoutError::Disconnected) => {
                log::trace!("termination: timeout watcher interrupted");
                return;
            }
            Ok(()) => continue,
            Err(RecvTimeoutError::Timeout) => break,
        }
    }
    if verdict
        .compare_exchange(PENDING, TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        log::info!("termination: global timeout of {:?} reached", budget);
    }
    let _ = wake.try_send(());
}

fn quiescence_watcher(
    performers: &[Arc<dyn Supervised>],
    interval: Duration,
    verdict: &AtomicU8,
    wake: &Receiver<()>,
) -> TerminationReason {
    let reason = loop {
        match verdict.load(Ordering::SeqCst) {
            TIMED_OUT => break TerminationReason::TimedOut,
            ABORTED => break TerminationReason::Aborted,
            _ => {}
        }
        if performers.iter().all(|p| p.is_idle_approx()) && confirm_idle(performers) {
            log::info!("termination: fixpoint reached");
            break TerminationReason::Fixpoint;
        }
        match wake.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break TerminationReason::Aborted,
        }
    };
    stop_all(performers);
    reason
}

/// Pauses every performer, evaluates the exact idle predicate in two passes
/// (all pools, then all inputs), and resumes them all again.
fn confirm_idle(performers: &[Arc<dyn Supervised>]) -> bool {
    let mut paused: Vec<&Arc<dyn Supervised>> = Vec::with_capacity(performers.len());
    let mut all_paused = true;
    for p in performers {
        match p.pause() {
            Ok(()) => paused.push(p),
            Err(e) => {
                log::debug!("termination: could not pause {}: {}", p.name(), e);
                // A stopped performer is idle by definition; anything else
                // cannot be confirmed this round.
                if p.is_idle_exact() != Some(true) {
                    all_paused = false;
                }
            }
        }
    }
    let idle = all_paused
        && performers.iter().all(|p| p.pool_idle_exact() == Some(true))
        && performers.iter().all(|p| p.input_empty_exact() == Some(true));
    for p in paused {
        if let Err(e) = p.resume() {
            log::debug!("termination: could not resume {}: {}", p.name(), e);
        }
    }
    if !idle {
        log::debug!("termination: idle snapshot not confirmed under pause");
    }
    idle
}

fn stop_all(performers: &[Arc<dyn Supervised>]) {
    for p in performers {
        p.stop();
    }
}
