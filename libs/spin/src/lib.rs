// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization primitives used by the strand scheduler.
//!
//! Everything in here spins. Nothing in here parks a thread; that is the job of the
//! monitor in the scheduler crate.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod atomic;
mod backoff;
mod loom;
mod mutex;
mod rw_lock;

pub use atomic::{Atomic, AtomicPrimitive};
pub use backoff::Backoff;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use rw_lock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard, upgrade};
