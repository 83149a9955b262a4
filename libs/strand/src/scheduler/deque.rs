// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-slot task deque.
//!
//! The owning thread pushes and pops at the tail without taking a lock. Thieves take
//! from the head, serialized against each other by a spin lock. Owner and thief only
//! meet when a single element is left: both announce their claim by moving their
//! index first and then check the other index, the loser backs off (the owner by
//! retrying under the lock).

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, Ordering, fence};
use strand_spin::Mutex;
use strand_util::CachePadded;

const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub(crate) enum TryStealError {
    /// Another thief is stealing from (or the owner is growing) this deque.
    Busy,
    /// There was nothing to steal.
    Empty,
}

pub(crate) struct Deque<T> {
    head: CachePadded<AtomicIsize>,
    tail: CachePadded<AtomicIsize>,
    /// Held by thieves, by the owner while growing the buffer, and by the owner when
    /// it races a thief for the last element.
    lock: Mutex<()>,
    buffer: UnsafeCell<Box<[UnsafeCell<MaybeUninit<T>>]>>,
}

// Safety: elements are moved in by the owner and out by exactly one thread, the
// head/tail protocol guarantees the same slot is never accessed concurrently.
unsafe impl<T: Send> Send for Deque<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for Deque<T> {}

// === impl Deque ===

impl<T> Deque<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicIsize::new(0)),
            tail: CachePadded::new(AtomicIsize::new(0)),
            lock: Mutex::new(()),
            buffer: UnsafeCell::new(Self::alloc_buffer(INITIAL_CAPACITY)),
        }
    }

    fn alloc_buffer(capacity: usize) -> Box<[UnsafeCell<MaybeUninit<T>>]> {
        debug_assert!(capacity.is_power_of_two());
        (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect()
    }

    /// Returns the number of elements, which may be stale by the time it is used.
    pub(crate) fn len(&self) -> usize {
        let t = self.tail.load(Ordering::SeqCst);
        let h = self.head.load(Ordering::SeqCst);
        usize::try_from(t - h).unwrap_or(0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes `value` at the tail.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning this deque.
    pub(crate) unsafe fn push(&self, value: T) {
        let t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);

        // Safety: only the owner replaces the buffer, and we are the owner
        let capacity = unsafe { self.buffer() }.len();
        if t - h >= capacity_isize(capacity) - 1 {
            let _guard = self.lock.lock();
            // Safety: we hold the lock, which keeps thieves out of the buffer
            unsafe { self.grow() };
        }

        // Safety: the slot at `t` is outside the range thieves may read (`h..t`)
        unsafe { self.write(t, value) };
        self.tail.store(t + 1, Ordering::SeqCst);
    }

    /// Pops the most recently pushed element.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning this deque.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let t = self.tail.load(Ordering::Relaxed) - 1;
        self.tail.store(t, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let h = self.head.load(Ordering::SeqCst);

        if h > t {
            // we raced a thief for the last element, or the deque was empty.
            // restore the tail and settle it under the lock
            self.tail.store(t + 1, Ordering::SeqCst);
            let _guard = self.lock.lock();

            let t = self.tail.load(Ordering::Relaxed) - 1;
            self.tail.store(t, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            let h = self.head.load(Ordering::SeqCst);
            if h > t {
                self.tail.store(t + 1, Ordering::SeqCst);
                return None;
            }

            // Safety: `h <= t` and thieves are locked out, so the slot is ours
            return Some(unsafe { self.read(t) });
        }

        // Safety: thieves check the tail after claiming the head, a thief that reached
        // `t` backs off
        Some(unsafe { self.read(t) })
    }

    /// Takes the least recently pushed element.
    pub(crate) fn steal(&self) -> Result<T, TryStealError> {
        if self.is_empty() {
            return Err(TryStealError::Empty);
        }

        let Some(_guard) = self.lock.try_lock() else {
            return Err(TryStealError::Busy);
        };

        let h = self.head.load(Ordering::Relaxed);
        self.head.store(h + 1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let t = self.tail.load(Ordering::SeqCst);

        if h + 1 > t {
            // the owner popped the element in the meantime
            self.head.store(h, Ordering::SeqCst);
            return Err(TryStealError::Empty);
        }

        // Safety: we claimed `h` and the owner would have backed off from it
        Ok(unsafe { self.read(h) })
    }

    /// # Safety
    ///
    /// The caller must be the owner, or hold the lock.
    unsafe fn buffer(&self) -> &[UnsafeCell<MaybeUninit<T>>] {
        // Safety: ensured by caller
        unsafe { &*self.buffer.get() }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the slot at `index`.
    unsafe fn write(&self, index: isize, value: T) {
        // Safety: ensured by caller
        unsafe {
            let buffer = self.buffer();
            let slot = &buffer[slot_index(index, buffer.len())];
            (*slot.get()).write(value);
        }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the initialized slot at `index`.
    unsafe fn read(&self, index: isize) -> T {
        // Safety: ensured by caller
        unsafe {
            let buffer = self.buffer();
            let slot = &buffer[slot_index(index, buffer.len())];
            (*slot.get()).assume_init_read()
        }
    }

    /// Doubles the buffer.
    ///
    /// # Safety
    ///
    /// Must be called by the owner while holding the lock.
    unsafe fn grow(&self) {
        let h = self.head.load(Ordering::Relaxed);
        let t = self.tail.load(Ordering::Relaxed);

        // Safety: ensured by caller
        let old = unsafe { &mut *self.buffer.get() };
        let new = Self::alloc_buffer(old.len() * 2);
        for i in h..t {
            let from = &old[slot_index(i, old.len())];
            let to = &new[slot_index(i, new.len())];
            // Safety: `h..t` are initialized, each element is moved exactly once
            unsafe { (*to.get()).write((*from.get()).assume_init_read()) };
        }
        tracing::trace!(capacity = new.len(), "growing task deque");
        *old = new;
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        let h = *self.head.get_mut();
        let t = *self.tail.get_mut();
        for i in h..t {
            // Safety: `h..t` are initialized and nobody else can observe the deque
            drop(unsafe { self.read(i) });
        }
    }
}

impl<T> fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deque")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[expect(
    clippy::cast_sign_loss,
    reason = "deque indices start at zero and only grow"
)]
#[inline]
fn slot_index(index: isize, capacity: usize) -> usize {
    debug_assert!(index >= 0);
    (index as usize) & (capacity - 1)
}

#[inline]
fn capacity_isize(capacity: usize) -> isize {
    isize::try_from(capacity).unwrap_or(isize::MAX)
}
