// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::deque::{Deque, TryStealError};
use crate::sync::Monitor;
use crate::task::TaskRef;
use rand::Rng;
use rand::rngs::SmallRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use strand_spin::{Backoff, Mutex};
use strand_util::CachePadded;

/// The shared state of a runtime: one deque per thread slot plus the monitor idle
/// threads park on.
///
/// Slots `0..num_workers` belong to the runtime's worker threads, the remaining
/// slots are handed out to threads that join the arena from the outside.
#[derive(Debug)]
pub(crate) struct Arena {
    slots: Box<[CachePadded<Slot>]>,
    num_workers: usize,
    /// One past the highest slot index that was ever occupied, bounds the steal scan.
    limit: AtomicUsize,
    monitor: Monitor,
    stop: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    steal_rounds: usize,
}

#[derive(Debug)]
pub(crate) struct Slot {
    occupied: AtomicBool,
    deque: Deque<TaskRef>,
}

// === impl Arena ===

impl Arena {
    pub(crate) fn new(num_workers: usize, max_masters: usize, steal_rounds: usize) -> Self {
        let slots = (0..num_workers + max_masters)
            .map(|_| {
                CachePadded::new(Slot {
                    occupied: AtomicBool::new(false),
                    deque: Deque::new(),
                })
            })
            .collect();

        Self {
            slots,
            num_workers,
            limit: AtomicUsize::new(num_workers),
            monitor: Monitor::new(),
            stop: AtomicBool::new(false),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            steal_rounds,
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub(crate) fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub(crate) fn deque(&self, slot: usize) -> &Deque<TaskRef> {
        &self.slots[slot].deque
    }

    pub(crate) fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Marks the worker slot `slot` as occupied.
    pub(crate) fn occupy_worker_slot(&self, slot: usize) {
        debug_assert!(slot < self.num_workers);
        let was_occupied = self.slots[slot].occupied.swap(true, Ordering::AcqRel);
        debug_assert!(!was_occupied, "worker slot {slot} occupied twice");
    }

    /// Finds a free slot for a thread that joins from the outside.
    pub(crate) fn claim_master_slot(&self) -> Option<usize> {
        let slot = (self.num_workers..self.slots.len()).find(|&i| {
            self.slots[i]
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })?;

        self.limit.fetch_max(slot + 1, Ordering::AcqRel);
        tracing::debug!(slot, "master thread joined arena");
        Some(slot)
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        debug_assert!(
            self.slots[slot].deque.is_empty(),
            "slot {slot} released with pending tasks"
        );
        self.slots[slot].occupied.store(false, Ordering::Release);
    }

    /// Returns `true` if any slot has tasks that could be stolen.
    pub(crate) fn has_work(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        self.slots[..limit].iter().any(|slot| !slot.deque.is_empty())
    }

    /// Tries to steal a task from any slot other than `thief`.
    ///
    /// Victims are scanned starting at a random slot, the scan is repeated a configured
    /// number of rounds with backoff in between.
    pub(crate) fn steal(&self, thief: usize, rng: &mut SmallRng) -> Option<TaskRef> {
        let limit = self.limit.load(Ordering::Acquire);
        // if there is only one thread, there is no one to steal from anyway
        if limit <= 1 {
            return None;
        }

        let mut backoff = Backoff::new();
        for _ in 0..self.steal_rounds {
            let start = rng.random_range(0..limit);

            let mut busy = false;
            for i in 0..limit {
                let victim = (start + i) % limit;

                // Don't steal from ourselves! We know we don't have work.
                if victim == thief {
                    continue;
                }

                match self.slots[victim].deque.steal() {
                    Ok(task) => {
                        tracing::trace!(thief, victim, task.id = %task.id(), "stole task");
                        return Some(task);
                    }
                    Err(TryStealError::Busy) => busy = true,
                    Err(TryStealError::Empty) => {}
                }
            }

            if !busy && !self.has_work() {
                return None;
            }
            backoff.spin();
        }

        None
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stops all worker threads and waits for them to exit.
    ///
    /// If called from one of the arena's own workers, that worker is detached instead
    /// of joined.
    pub(crate) fn shutdown(&self) {
        tracing::debug!(workers = self.num_workers, "shutting down arena");
        self.stop.store(true, Ordering::Release);
        self.monitor.notify_all();

        let workers = core::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for worker in workers {
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
