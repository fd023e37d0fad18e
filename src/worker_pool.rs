// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity pool of worker threads that can be paused between jobs.
//!
//! The active count is incremented when a job is accepted by `submit`, not
//! when it starts running, and decremented once the job returns. While the
//! pool is paused no queued job can start, so `is_idle` is exact at that
//! point: it is true iff every accepted job has finished.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::pathweave_error::PathweaveError;

/// Cooperative cancellation flag handed to every running job. Set when the
/// owning pool shuts down; long-running collaborators should poll it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub type Job = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

#[derive(Debug, Default)]
struct PoolState {
    paused: bool,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    capacity: usize,
    active: AtomicUsize,
    state: Mutex<PoolState>,
    /// Units parked on a pause wait here.
    resumed: Condvar,
    /// Signaled whenever a job finishes or the pool changes mode.
    slot_freed: Condvar,
    cancel: CancelToken,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A panicking job never holds this lock, so poisoning can only come
        // from a bug in this module; recover the flags rather than cascade.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Blocks while paused. Returns false if the pool shut down, in which
    /// case the dequeued job must be discarded.
    fn wait_until_runnable(&self) -> bool {
        let mut st = self.lock_state();
        while st.paused && !st.shutdown {
            st = self
                .resumed
                .wait(st)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        !st.shutdown
    }

    fn finish_one(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let _st = self.lock_state();
        self.slot_freed.notify_all();
    }

    fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.active.load(Ordering::SeqCst))
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, capacity: usize) -> Result<Self, PathweaveError> {
        if capacity == 0 {
            return Err(PathweaveError::InvalidConfig(format!(
                "worker pool {} must have at least one worker",
                name
            )));
        }
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            capacity,
            active: AtomicUsize::new(0),
            state: Mutex::new(PoolState::default()),
            resumed: Condvar::new(),
            slot_freed: Condvar::new(),
            cancel: CancelToken::new(),
        });
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let pool = WorkerPool {
            shared,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(capacity)),
        };
        for unit in 0..capacity {
            let handle = spawn_unit(Arc::clone(&pool.shared), rx.clone(), unit)?;
            pool.lock_workers().push(handle);
        }
        Ok(pool)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Queues `job` and counts it as active immediately. Never blocks.
    /// Returns false (and drops the job) if the pool has been shut down.
    pub fn submit(&self, job: Job) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|poison| poison.into_inner());
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.shared.finish_one();
            return false;
        }
        true
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    /// True iff no accepted job is outstanding. Exact only while paused.
    pub fn is_idle(&self) -> bool {
        self.active_count() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock_state().paused
    }

    pub fn pause(&self) {
        let mut st = self.shared.lock_state();
        st.paused = true;
        self.shared.slot_freed.notify_all();
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock_state();
        st.paused = false;
        self.shared.resumed.notify_all();
    }

    /// Waits until at least `min` slots are free. Returns false if `max_wait`
    /// elapses first, or as soon as the pool is paused or shut down so the
    /// caller can re-examine its own control state.
    pub fn wait_for_available(&self, min: usize, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut st = self.shared.lock_state();
        loop {
            if self.shared.available() >= min {
                return true;
            }
            if st.paused || st.shutdown {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            st = self
                .shared
                .slot_freed
                .wait_timeout(st, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poison| poison.into_inner().0);
        }
    }

    /// Discards queued jobs, cancels in-flight ones through their
    /// `CancelToken`, and lets every unit exit. Does not wait for in-flight
    /// jobs; see `join`.
    pub fn shutdown(&self) {
        let was_open = self
            .tx
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
            .is_some();
        {
            let mut st = self.shared.lock_state();
            st.shutdown = true;
            self.shared.resumed.notify_all();
            self.shared.slot_freed.notify_all();
        }
        self.shared.cancel.cancel();
        if was_open {
            log::debug!(
                "pool {}: shutdown with {} job(s) outstanding",
                self.shared.name,
                self.active_count()
            );
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock_state().shutdown
    }

    /// Waits for every unit thread to exit. Call after `shutdown`.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("pool {}: worker thread panicked", self.shared.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_unit(
    shared: Arc<PoolShared>,
    rx: Receiver<Job>,
    unit: usize,
) -> Result<JoinHandle<()>, PathweaveError> {
    let thread_name = format!("{}-worker-{}", shared.name, unit);
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                if !shared.wait_until_runnable() {
                    shared.finish_one();
                    continue;
                }
                let cancel = shared.cancel.clone();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(&cancel))) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "<non-string panic payload>".to_string());
                    log::warn!("pool {}: job panicked: {}", shared.name, message);
                }
                shared.finish_one();
            }
            log::trace!("pool {}: unit {} exiting", shared.name, unit);
        })
        .map_err(|e| PathweaveError::Spawn {
            name: thread_name,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            WorkerPool::new("p", 0),
            Err(PathweaveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn submit_counts_job_active_until_it_finishes() {
        let pool = WorkerPool::new("p", 2).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        assert!(pool.is_idle());
        assert!(pool.submit(Box::new(move |_| {
            release_rx.recv().unwrap();
        })));
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.available(), 1);
        assert!(!pool.is_idle());
        release_tx.send(()).unwrap();
        assert!(wait_until(|| pool.is_idle()));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn paused_pool_does_not_start_queued_jobs() {
        let pool = WorkerPool::new("p", 1).unwrap();
        let (done_tx, done_rx) = mpsc::channel::<u32>();
        pool.pause();
        assert!(pool.is_paused());
        let tx = done_tx.clone();
        pool.submit(Box::new(move |_| tx.send(1).unwrap()));
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        // Exact while paused: one accepted job, nothing finished.
        assert!(!pool.is_idle());
        pool.resume();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert!(wait_until(|| pool.is_idle()));
    }

    #[test]
    fn pause_does_not_interrupt_running_job() {
        let pool = WorkerPool::new("p", 1).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            done_tx.send(()).unwrap();
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.pause();
        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(wait_until(|| pool.is_idle()));
    }

    #[test]
    fn panicking_job_is_contained() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = WorkerPool::new("p", 1).unwrap();
        pool.submit(Box::new(|_| panic!("collaborator blew up")));
        let (tx, rx) = mpsc::channel::<u32>();
        pool.submit(Box::new(move |_| tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert!(wait_until(|| pool.is_idle()));
    }

    #[test]
    fn wait_for_available_returns_when_slot_frees() {
        let pool = Arc::new(WorkerPool::new("p", 1).unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move |_| {
            release_rx.recv().unwrap();
        }));
        assert!(!pool.wait_for_available(1, Duration::from_millis(20)));
        release_tx.send(()).unwrap();
        assert!(pool.wait_for_available(1, Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_discards_queued_jobs_and_cancels_running_ones() {
        let pool = WorkerPool::new("p", 1).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (saw_cancel_tx, saw_cancel_rx) = mpsc::channel::<bool>();
        pool.submit(Box::new(move |cancel| {
            started_tx.send(()).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !cancel.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            saw_cancel_tx.send(cancel.is_cancelled()).unwrap();
        }));
        let (ran_tx, ran_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move |_| ran_tx.send(()).unwrap()));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.shutdown();
        assert!(saw_cancel_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        pool.join();
        assert!(ran_rx.try_recv().is_err());
        assert!(pool.is_idle());
        assert!(!pool.submit(Box::new(|_| {})));
    }
}
