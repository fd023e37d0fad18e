// SPDX-License-Identifier: Apache-2.0

//! Unbounded FIFO channels that connect two performers.
//!
//! The producer side never blocks. The consumer side drains at most `max`
//! items per call, waiting at most `timeout` for each individual item, so a
//! single `poll_batch` never waits longer than `max * timeout`.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

pub trait Buffer<E>: Send + Sync {
    /// Appends `item` at the tail. Always succeeds and never blocks.
    fn add(&self, item: E) -> bool;

    /// Removes up to `max` items, each removal bounded by `timeout`. Returns
    /// early (possibly empty) the first time a single removal times out.
    fn poll_batch(&self, max: usize, timeout: Duration) -> Vec<E>;

    /// Point-in-time snapshot; only authoritative while both sides of the
    /// buffer are paused.
    fn is_empty(&self) -> bool;

    /// Racy size snapshot, for progress reporting.
    fn len(&self) -> usize;
}

/// Plain FIFO buffer.
pub struct FifoBuffer<E> {
    tx: Sender<E>,
    rx: Receiver<E>,
}

impl<E> FifoBuffer<E> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        FifoBuffer { tx, rx }
    }
}

impl<E> Default for FifoBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send> Buffer<E> for FifoBuffer<E> {
    fn add(&self, item: E) -> bool {
        // Both ends live in `self`, so the channel cannot be disconnected.
        self.tx.send(item).is_ok()
    }

    fn poll_batch(&self, max: usize, timeout: Duration) -> Vec<E> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.rx.recv_timeout(timeout) {
                Ok(item) => batch.push(item),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        batch
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Two-class FIFO buffer: items for which the predicate holds are always
/// delivered before ordinary items. Order is preserved within each class.
pub struct PriorityBuffer<E> {
    is_priority: Box<dyn Fn(&E) -> bool + Send + Sync>,
    priority: FifoBuffer<E>,
    ordinary: FifoBuffer<E>,
}

impl<E> PriorityBuffer<E> {
    pub fn new(is_priority: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        PriorityBuffer {
            is_priority: Box::new(is_priority),
            priority: FifoBuffer::new(),
            ordinary: FifoBuffer::new(),
        }
    }

    /// Takes one item, preferring the priority class, waiting until
    /// `deadline` for either class to become non-empty.
    fn poll_one(&self, deadline: Instant) -> Option<E> {
        match self.priority.rx.try_recv() {
            Ok(item) => return Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        match self.ordinary.rx.try_recv() {
            Ok(item) => return Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        // Both empty right now: block on whichever arrives first. A priority
        // item that races in alongside an ordinary one is still preferred on
        // the next removal.
        crossbeam_channel::select! {
            recv(self.priority.rx) -> item => item.ok(),
            recv(self.ordinary.rx) -> item => item.ok(),
            default(deadline.saturating_duration_since(Instant::now())) => None,
        }
    }
}

impl<E: Send> Buffer<E> for PriorityBuffer<E> {
    fn add(&self, item: E) -> bool {
        if (self.is_priority)(&item) {
            self.priority.add(item)
        } else {
            self.ordinary.add(item)
        }
    }

    fn poll_batch(&self, max: usize, timeout: Duration) -> Vec<E> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.poll_one(Instant::now() + timeout) {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.ordinary.is_empty()
    }

    fn len(&self) -> usize {
        self.priority.len() + self.ordinary.len()
    }
}
