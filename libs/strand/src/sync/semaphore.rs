// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// A binary semaphore that only its owning thread waits on.
///
/// Posting while the token is already available is a no-op, so any number of posts
/// between two waits collapse into one.
#[derive(Debug)]
pub(crate) struct BinarySemaphore {
    token: AtomicBool,
    owner: Thread,
}

// === impl BinarySemaphore ===

impl BinarySemaphore {
    /// Creates a semaphore owned by the calling thread.
    pub(crate) fn new() -> Self {
        Self {
            token: AtomicBool::new(false),
            owner: thread::current(),
        }
    }

    /// Blocks until the token is available and takes it.
    pub(crate) fn wait(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner.id(),
            "only the owning thread may wait on its semaphore"
        );

        // `park` may return spuriously, the token is the only source of truth
        while !self.token.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }

    /// Makes the token available and wakes the owner.
    pub(crate) fn post(&self) {
        self.token.store(true, Ordering::Release);
        self.owner.unpark();
    }
}
