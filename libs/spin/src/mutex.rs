// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Atomic, Backoff};
use core::sync::atomic::Ordering;

pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

/// A test-and-set spin lock on a single byte.
///
/// Meant for short, mostly uncontended critical sections such as linking a node into
/// an intrusive list.
pub struct RawMutex {
    flag: Atomic<u8>,
}

// Safety: `lock` only returns once this thread flipped `flag` from `UNLOCKED` to
// `LOCKED`, so at most one thread holds the lock at any time.
unsafe impl lock_api::RawMutex for RawMutex {
    type GuardMarker = lock_api::GuardSend;

    const INIT: Self = Self {
        flag: Atomic::<u8>::new(UNLOCKED),
    };

    fn lock(&self) {
        let mut backoff = Backoff::new();
        while !self.try_lock() {
            // wait for the holder to let go before hammering the cache line again
            while self.is_locked() {
                backoff.pause();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.flag.compare_and_swap(LOCKED, UNLOCKED, Ordering::Acquire) == UNLOCKED
    }

    unsafe fn unlock(&self) {
        self.flag.store(UNLOCKED, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed) == LOCKED
    }
}
