// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A writer-preferring reader-writer spin lock packed into a single word.
//!
//! Layout of the state word:
//!
//! ```text
//!  usize::BITS-1                 2   1   0
//! +-------------------------------+---+---+
//! |          reader count         | P | W |
//! +-------------------------------+---+---+
//! ```
//!
//! `W` is set while a writer holds the lock, `P` is a hint set by a blocked writer so
//! that new readers back off instead of starving it.

use core::fmt;
use core::sync::atomic::Ordering;

use crate::{Atomic, Backoff};

const WRITER: usize = 1;
const WRITER_PENDING: usize = 1 << 1;
const READERS: usize = !(WRITER | WRITER_PENDING);
const ONE_READER: usize = 1 << 2;
/// Anything but the pending hint means the lock is held.
const BUSY: usize = WRITER | READERS;

pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;

pub struct RawRwLock {
    state: Atomic<usize>,
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawRwLock")
            .field("writer", &(s & WRITER != 0))
            .field("writer_pending", &(s & WRITER_PENDING != 0))
            .field("readers", &((s & READERS) / ONE_READER))
            .finish()
    }
}

// === impl RawRwLock ===

impl RawRwLock {
    /// Returns the number of readers currently holding the lock.
    #[must_use]
    pub fn readers(&self) -> usize {
        (self.state.load(Ordering::Relaxed) & READERS) / ONE_READER
    }

    /// Returns `true` if a writer announced that it is waiting for the lock.
    #[must_use]
    pub fn is_writer_pending(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER_PENDING != 0
    }

    /// Upgrades a shared lock held by the caller into an exclusive one.
    ///
    /// Returns `true` if the upgrade happened in place, that is the calling thread held
    /// on to the lock the entire time. Returns `false` if the shared lock had to be
    /// released and the exclusive lock acquired from scratch, in which case another
    /// writer may have modified the protected data in between and anything read under
    /// the shared lock must be considered stale.
    ///
    /// The in-place path is taken when the caller is the only reader, or when no other
    /// writer is pending. With several readers and a pending writer two upgrades could
    /// deadlock each other, so the lock is released instead.
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared lock.
    pub unsafe fn upgrade(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        debug_assert!(s & READERS != 0, "upgrade without holding a shared lock");

        while (s & READERS) == ONE_READER || (s & WRITER_PENDING) == 0 {
            let old = s;
            s = self
                .state
                .compare_and_swap(s | WRITER | WRITER_PENDING, old, Ordering::Acquire);
            if s == old {
                // new readers and writers are locked out now, wait for the other
                // readers to drain
                let mut backoff = Backoff::new();
                while self.state.load(Ordering::Acquire) & READERS != ONE_READER {
                    backoff.pause();
                }
                debug_assert_eq!(
                    self.state.load(Ordering::Relaxed) & (WRITER | WRITER_PENDING),
                    WRITER | WRITER_PENDING
                );

                // drop our own reader unit together with the pending hint
                self.state
                    .fetch_and_sub(ONE_READER + WRITER_PENDING, Ordering::AcqRel);
                return true;
            }
        }

        // SAFETY: ensured by caller
        unsafe {
            lock_api::RawRwLock::unlock_shared(self);
        }
        self.acquire_writer();
        false
    }

    fn acquire_writer(&self) {
        let mut backoff = Backoff::new();
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & BUSY == 0 {
                if self.state.compare_and_swap(WRITER, s, Ordering::Acquire) == s {
                    return;
                }
                // someone raced us, but the lock was free a moment ago
                backoff.reset();
            } else if s & WRITER_PENDING == 0 {
                self.state.fetch_and_or(WRITER_PENDING, Ordering::Relaxed);
            }
            backoff.pause();
        }
    }

    fn acquire_reader(&self) {
        let mut backoff = Backoff::new();
        while !self.try_acquire_reader() {
            backoff.pause();
        }
    }

    #[inline]
    fn try_acquire_reader(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_PENDING) != 0 {
            return false;
        }

        let prev = self.state.fetch_and_add(ONE_READER, Ordering::Acquire);
        if prev & WRITER == 0 {
            return true;
        }

        // a writer got in between our check and the increment, retract
        self.state.fetch_and_sub(ONE_READER, Ordering::Relaxed);
        false
    }

    #[inline]
    fn try_acquire_writer(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        s & BUSY == 0 && self.state.compare_and_swap(WRITER, s, Ordering::Acquire) == s
    }
}

// Safety: the writer bit is only ever set by a successful CAS from a state without
// readers or writers, and readers only keep their increment if no writer bit was set.
unsafe impl lock_api::RawRwLock for RawRwLock {
    const INIT: Self = Self {
        state: Atomic::<usize>::new(0),
    };
    type GuardMarker = lock_api::GuardSend;

    fn lock_shared(&self) {
        self.acquire_reader();
    }

    fn try_lock_shared(&self) -> bool {
        self.try_acquire_reader()
    }

    unsafe fn unlock_shared(&self) {
        debug_assert!(self.readers() > 0, "unlock_shared without readers");
        self.state.fetch_and_sub(ONE_READER, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        self.acquire_writer();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_acquire_writer()
    }

    unsafe fn unlock_exclusive(&self) {
        debug_assert!(
            self.state.load(Ordering::Relaxed) & WRITER != 0,
            "unlock_exclusive without a writer"
        );
        // keep whatever readers raced their increment in, they will retract it
        self.state.fetch_and_and(READERS, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & BUSY != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

// Safety: turning the writer bit into one reader unit in a single atomic add never
// lets another writer observe an unlocked state.
unsafe impl lock_api::RawRwLockDowngrade for RawRwLock {
    unsafe fn downgrade(&self) {
        self.state
            .fetch_and_add(ONE_READER.wrapping_sub(WRITER), Ordering::Release);
    }
}

/// Upgrades a read guard into a write guard.
///
/// The returned flag tells whether the upgrade happened in place, see
/// [`RawRwLock::upgrade`] for what that means for data observed through the read guard.
pub fn upgrade<T: ?Sized>(guard: RwLockReadGuard<'_, T>) -> (RwLockWriteGuard<'_, T>, bool) {
    let lock = RwLockReadGuard::rwlock(&guard);
    core::mem::forget(guard);

    // Safety: we owned a read guard, which we leaked above. Its shared lock is turned
    // into the exclusive lock the returned guard releases.
    unsafe {
        let in_place = lock.raw().upgrade();
        (lock.make_write_guard_unchecked(), in_place)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;
    use lock_api::{RawRwLock as _, RawRwLockDowngrade};
    use std::time::Duration;

    use super::*;
    use crate::loom;
    use crate::loom::thread;

    const MAX_READERS: usize = 50;

    /// Assert that a write lock cannot be obtained while read locks are held
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn writer_waits_for_readers() {
        let l = RawRwLock::INIT;

        for _ in 0..MAX_READERS {
            assert!(l.try_lock_shared());
            assert!(!l.try_lock_exclusive());
        }
        assert_eq!(l.readers(), MAX_READERS);

        for _ in 0..MAX_READERS {
            assert!(!l.try_lock_exclusive());
            unsafe {
                l.unlock_shared();
            }
        }

        assert!(l.try_lock_exclusive());
    }

    /// Assert that read locks cannot be obtained while a write lock is held
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn readers_wait_for_writer() {
        let l = RawRwLock::INIT;

        assert!(l.try_lock_exclusive());
        assert!(l.is_locked_exclusive());
        assert!(l.is_locked());

        for _ in 0..MAX_READERS {
            assert!(!l.try_lock_shared());
        }

        unsafe {
            l.unlock_exclusive();
        }

        for _ in 0..MAX_READERS {
            assert!(l.try_lock_shared());
            assert!(l.is_locked());
        }
    }

    /// Assert that a write lock cannot be obtained while another write lock is held
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn writer_waits_for_writer() {
        let l = RawRwLock::INIT;

        assert!(l.try_lock_exclusive());
        assert!(!l.try_lock_exclusive());

        unsafe {
            l.unlock_exclusive();
        }

        assert!(l.try_lock_exclusive());
        assert!(!l.try_lock_exclusive());
    }

    /// Assert that downgrading keeps the lock held but lets readers in
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn downgrade() {
        let l = RawRwLock::INIT;

        assert!(l.try_lock_exclusive());
        for _ in 0..MAX_READERS {
            assert!(!l.try_lock_shared());
        }

        unsafe {
            l.downgrade();
        }
        assert!(!l.is_locked_exclusive());
        assert_eq!(l.readers(), 1);
        assert!(!l.try_lock_exclusive());

        for _ in 0..MAX_READERS {
            assert!(l.try_lock_shared());
        }
        assert_eq!(l.readers(), MAX_READERS + 1);
    }

    /// Assert that the pending hint keeps new readers out
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn pending_writer_blocks_new_readers() {
        let l = RawRwLock::INIT;
        assert!(l.try_lock_shared());

        // what a blocked writer does before it starts spinning
        l.state.fetch_and_or(WRITER_PENDING, Ordering::Relaxed);
        assert!(l.is_writer_pending());
        assert!(!l.try_lock_shared());

        unsafe { l.unlock_shared() };

        // the writer clears the hint when it gets in
        assert!(l.try_lock_exclusive());
        assert!(!l.is_writer_pending());
        unsafe { l.unlock_exclusive() };
        assert_eq!(l.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn upgrade_sole_reader_in_place() {
        let l = RawRwLock::INIT;
        assert!(l.try_lock_shared());

        assert!(unsafe { l.upgrade() });
        assert!(l.is_locked_exclusive());
        assert_eq!(l.readers(), 0);
        assert!(!l.is_writer_pending());

        unsafe { l.unlock_exclusive() };
        assert_eq!(l.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn upgrade_with_other_readers_no_pending_writer_in_place() {
        lazy_static::lazy_static! {
            static ref L: RawRwLock = RawRwLock::INIT;
        }

        assert!(L.try_lock_shared());
        assert!(L.try_lock_shared());

        let upgrader = std::thread::spawn(|| {
            assert!(L.try_lock_shared());
            // other readers are still around, but nobody else wants to write
            let in_place = unsafe { L.upgrade() };
            assert!(L.is_locked_exclusive());
            unsafe { L.unlock_exclusive() };
            in_place
        });

        // the upgrader holds the writer bit and waits for us to leave
        while !L.is_locked_exclusive() {
            std::thread::yield_now();
        }
        unsafe {
            L.unlock_shared();
            L.unlock_shared();
        }

        assert!(upgrader.join().unwrap());
        assert!(!L.is_locked());
    }

    /// The one path where upgrading must give up the lock: multiple readers and a
    /// writer that is already waiting.
    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn upgrade_reacquires_with_pending_writer() {
        lazy_static::lazy_static! {
            static ref L: RawRwLock = RawRwLock::INIT;
            static ref WRITES: AtomicUsize = AtomicUsize::new(0);
        }

        // the "other" reader, and the read lock handed over to the upgrader. Taken up
        // front since a pending writer keeps new readers out.
        assert!(L.try_lock_shared());
        assert!(L.try_lock_shared());

        let upgrader = std::thread::spawn(|| {
            // wait for the competing writer to announce itself
            while !L.is_writer_pending() {
                std::thread::yield_now();
            }
            let in_place = unsafe { L.upgrade() };
            let held = L.is_locked_exclusive();
            WRITES.fetch_add(1, Ordering::AcqRel);
            unsafe { L.unlock_exclusive() };
            (in_place, held)
        });

        let writer = std::thread::spawn(|| {
            L.lock_exclusive();
            WRITES.fetch_add(1, Ordering::AcqRel);
            unsafe { L.unlock_exclusive() };
        });

        // give the upgrader a chance to drop its read lock and start spinning for the
        // writer bit, then let everybody through
        while L.readers() > 1 {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(10));
        unsafe { L.unlock_shared() };

        let (in_place, held) = upgrader.join().unwrap();
        writer.join().unwrap();

        assert!(!in_place, "upgrade must report that it re-acquired the lock");
        assert!(held, "upgrader must hold the writer lock after re-acquiring");
        assert_eq!(WRITES.load(Ordering::Acquire), 2);
        assert!(!L.is_locked());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn guard_upgrade() {
        let lock = RwLock::new(1);
        let read = lock.read();
        assert_eq!(*read, 1);

        let (mut write, in_place) = upgrade(read);
        assert!(in_place);
        *write += 1;
        drop(write);

        assert_eq!(*lock.read(), 2);
    }

    /// Number of cycles to repeat concurrency tests for, but loom and miri are really slow
    /// and should probably catch any bugs after much fewer iterations anyway
    const CYCLES: usize = if cfg!(loom) | cfg!(miri) { 100 } else { 500 };

    #[test]
    fn concurrent_tests() {
        loom::model(|| {
            loom::lazy_static! {
                static ref L: RawRwLock = RawRwLock::INIT;
                static ref READERS_INSIDE: AtomicUsize = AtomicUsize::new(0);
                static ref WRITERS_INSIDE: AtomicUsize = AtomicUsize::new(0);
            }

            let mut threads = Vec::new();
            for _ in 0..loom::MAX_THREADS - 1 {
                threads.push(thread::spawn(|| {
                    for _ in 0..CYCLES {
                        if rand::random_bool(0.1) {
                            L.lock_exclusive();
                            assert_eq!(WRITERS_INSIDE.fetch_add(1, Ordering::AcqRel), 0);
                            assert_eq!(READERS_INSIDE.load(Ordering::Acquire), 0);
                            WRITERS_INSIDE.fetch_sub(1, Ordering::AcqRel);
                            unsafe { L.unlock_exclusive() };
                        } else {
                            L.lock_shared();
                            READERS_INSIDE.fetch_add(1, Ordering::AcqRel);
                            assert_eq!(WRITERS_INSIDE.load(Ordering::Acquire), 0);
                            READERS_INSIDE.fetch_sub(1, Ordering::AcqRel);
                            unsafe { L.unlock_shared() };
                        }

                        #[cfg(loom)]
                        thread::yield_now();
                    }
                }));
            }

            for t in threads {
                t.join().unwrap();
            }

            assert!(!L.is_locked());
        })
    }

    #[test]
    fn concurrent_upgrade_downgrade() {
        loom::model(|| {
            loom::lazy_static! {
                static ref L: RawRwLock = RawRwLock::INIT;
                static ref WRITERS_INSIDE: AtomicUsize = AtomicUsize::new(0);
                static ref REACQUIRED: AtomicUsize = AtomicUsize::new(0);
            }

            let mut threads = Vec::new();
            for _ in 0..loom::MAX_THREADS - 1 {
                threads.push(thread::spawn(|| {
                    for _ in 0..CYCLES {
                        let r = rand::random::<u8>();
                        if r < 64 {
                            // read, upgrade, write, downgrade, read
                            L.lock_shared();
                            if !unsafe { L.upgrade() } {
                                REACQUIRED.fetch_add(1, Ordering::Relaxed);
                            }
                            assert_eq!(WRITERS_INSIDE.fetch_add(1, Ordering::AcqRel), 0);
                            WRITERS_INSIDE.fetch_sub(1, Ordering::AcqRel);
                            unsafe {
                                L.downgrade();
                                L.unlock_shared();
                            }
                        } else if r < 96 {
                            L.lock_exclusive();
                            assert_eq!(WRITERS_INSIDE.fetch_add(1, Ordering::AcqRel), 0);
                            WRITERS_INSIDE.fetch_sub(1, Ordering::AcqRel);
                            unsafe { L.unlock_exclusive() };
                        } else {
                            L.lock_shared();
                            assert_eq!(WRITERS_INSIDE.load(Ordering::Acquire), 0);
                            unsafe { L.unlock_shared() };
                        }

                        #[cfg(loom)]
                        thread::yield_now();
                    }
                }));
            }

            for t in threads {
                t.join().unwrap();
            }

            assert!(!L.is_locked(), "{:?}", &*L);
            println!("REACQUIRED: {}", REACQUIRED.load(Ordering::Relaxed));
        })
    }
}
