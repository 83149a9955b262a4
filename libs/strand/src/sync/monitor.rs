// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::BinarySemaphore;
use cordyceps::{Linked, List, list};
use core::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use strand_spin::Mutex;

/// A wait/notify facility for threads that have nothing to do.
///
/// Waiting is a three step protocol that closes the window between checking a
/// condition and going to sleep:
///
/// ```text
/// if !condition() {
///     monitor.prepare_wait(&waiter, cookie);
///     if condition() {
///         monitor.cancel_wait(&waiter);
///     } else {
///         monitor.commit_wait(&waiter);
///     }
/// }
/// ```
///
/// Any notification issued after `prepare_wait` bumps the monitor's epoch, so a
/// `commit_wait` that races with it returns immediately instead of sleeping through
/// the wake-up.
///
/// Each waiting thread owns a [`Waiter`] with a private binary semaphore. Notifiers
/// unlink waiters from the wait-set under a short spin lock and post their
/// semaphores after releasing it.
#[derive(Debug)]
pub(crate) struct Monitor {
    epoch: AtomicUsize,
    /// Mirrors the length of `waitset` so notifiers can skip the lock.
    waiters: AtomicUsize,
    waitset: Mutex<List<Waiter>>,
}

/// Per-thread state of a monitor waiter.
#[derive(Debug)]
pub(crate) struct Waiter {
    links: list::Links<Waiter>,
    /// Snapshot of the monitor epoch taken by `prepare_wait`.
    epoch: AtomicUsize,
    /// Opaque value notifiers can select waiters by.
    cookie: AtomicUsize,
    in_waitset: AtomicBool,
    /// A notifier unlinked us after we decided not to wait, its post is still
    /// outstanding and must be consumed before the next wait.
    spurious: AtomicBool,
    sema: BinarySemaphore,
}

// === impl Monitor ===

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            waitset: Mutex::new(List::new()),
        }
    }

    /// Announces that `waiter` is about to block.
    ///
    /// Must be called by the thread owning `waiter`, *before* it re-checks its wake-up
    /// condition.
    pub(crate) fn prepare_wait(&self, waiter: &Arc<Waiter>, cookie: usize) {
        // consume the post of a notifier that raced our last cancel_wait
        if waiter.spurious.swap(false, Ordering::Relaxed) {
            waiter.sema.wait();
        }

        waiter.cookie.store(cookie, Ordering::Relaxed);
        waiter.in_waitset.store(true, Ordering::Relaxed);
        {
            let mut waitset = self.waitset.lock();
            waiter
                .epoch
                .store(self.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
            waitset.push_back(waiter.clone());
            self.waiters.fetch_add(1, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    /// Blocks until notified, unless a notification happened since `prepare_wait`.
    ///
    /// Returns `true` if the thread actually slept.
    pub(crate) fn commit_wait(&self, waiter: &Arc<Waiter>) -> bool {
        if waiter.epoch.load(Ordering::Relaxed) == self.epoch.load(Ordering::SeqCst) {
            waiter.sema.wait();
            true
        } else {
            self.cancel_wait(waiter);
            false
        }
    }

    /// Abandons a wait started with `prepare_wait`.
    pub(crate) fn cancel_wait(&self, waiter: &Arc<Waiter>) {
        // assume a notifier already took us out, the next prepare_wait pumps its post
        waiter.spurious.store(true, Ordering::Relaxed);

        if waiter.in_waitset.load(Ordering::Relaxed) {
            let mut waitset = self.waitset.lock();
            if waiter.in_waitset.load(Ordering::Relaxed) {
                // Safety: `in_waitset` is only true while the waiter is linked into
                // this monitor's wait-set, and we hold its lock.
                let handle = unsafe { waitset.remove(NonNull::from(&**waiter)) };
                debug_assert!(handle.is_some());
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                waiter.in_waitset.store(false, Ordering::Relaxed);
                waiter.spurious.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Returns `true` if any thread is in the wait-set.
    ///
    /// Only meaningful after a `SeqCst` fence that orders the caller's own state
    /// change before this load.
    #[inline]
    pub(crate) fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Relaxed) != 0
    }

    /// Wakes the longest waiting thread.
    ///
    /// Relaxed: the caller is responsible for the fence ordering its state change
    /// before the wait-set check. [`Monitor::notify_one`] does that for you.
    pub(crate) fn notify_one_relaxed(&self) {
        if !self.has_waiters() {
            return;
        }

        let woken = {
            let mut waitset = self.waitset.lock();
            self.epoch.fetch_add(1, Ordering::Relaxed);
            let woken = waitset.pop_front();
            if let Some(waiter) = &woken {
                self.waiters.fetch_sub(1, Ordering::Relaxed);
                waiter.in_waitset.store(false, Ordering::Relaxed);
            }
            woken
        };

        if let Some(waiter) = woken {
            tracing::trace!("monitor: waking one waiter");
            waiter.sema.post();
        }
    }

    /// Wakes every waiting thread.
    pub(crate) fn notify_all_relaxed(&self) {
        if !self.has_waiters() {
            return;
        }

        let mut woken = {
            let mut waitset = self.waitset.lock();
            self.epoch.fetch_add(1, Ordering::Relaxed);
            self.waiters.store(0, Ordering::Relaxed);
            let woken = core::mem::replace(&mut *waitset, List::new());
            for waiter in woken.iter() {
                waiter.in_waitset.store(false, Ordering::Relaxed);
            }
            woken
        };

        tracing::trace!(waiters = woken.len(), "monitor: waking all waiters");
        while let Some(waiter) = woken.pop_front() {
            waiter.sema.post();
        }
    }

    /// Wakes every waiting thread whose cookie satisfies `predicate`.
    pub(crate) fn notify_relaxed(&self, predicate: impl Fn(usize) -> bool) {
        if !self.has_waiters() {
            return;
        }

        let mut woken: List<Waiter> = List::new();
        {
            let mut waitset = self.waitset.lock();
            self.epoch.fetch_add(1, Ordering::Relaxed);

            let mut keep: List<Waiter> = List::new();
            while let Some(waiter) = waitset.pop_front() {
                if predicate(waiter.cookie.load(Ordering::Relaxed)) {
                    waiter.in_waitset.store(false, Ordering::Relaxed);
                    woken.push_back(waiter);
                } else {
                    keep.push_back(waiter);
                }
            }
            *waitset = keep;
            self.waiters.store(waitset.len(), Ordering::Relaxed);
        }

        while let Some(waiter) = woken.pop_front() {
            waiter.sema.post();
        }
    }

    pub(crate) fn notify_one(&self) {
        fence(Ordering::SeqCst);
        self.notify_one_relaxed();
    }

    pub(crate) fn notify_all(&self) {
        fence(Ordering::SeqCst);
        self.notify_all_relaxed();
    }

    pub(crate) fn notify(&self, predicate: impl Fn(usize) -> bool) {
        fence(Ordering::SeqCst);
        self.notify_relaxed(predicate);
    }
}

// === impl Waiter ===

impl Waiter {
    /// Creates the waiter of the calling thread.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            links: list::Links::new(),
            epoch: AtomicUsize::new(0),
            cookie: AtomicUsize::new(0),
            in_waitset: AtomicBool::new(false),
            spurious: AtomicBool::new(false),
            sema: BinarySemaphore::new(),
        })
    }
}

// Safety: the wait-set holds a strong reference for every linked waiter, so a waiter
// never moves or gets freed while linked.
unsafe impl Linked<list::Links<Self>> for Waiter {
    type Handle = Arc<Self>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        // Safety: `Arc::into_raw` never returns null
        unsafe { NonNull::new_unchecked(Arc::into_raw(handle).cast_mut()) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: ensured by caller, `ptr` came out of `into_ptr`
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: ensured by caller, `ptr` points to a live waiter
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}
