// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::EnterError;
use crate::runtime::{self, Builder, EnterGuard, Handle, NumThreads, Runtime};
use std::sync::Weak;
use strand_spin::Mutex;

/// The process-wide runtime shared by all `TaskSchedulerInit`s that are not nested in
/// an explicitly entered runtime.
///
/// Only a weak reference is kept here, the runtime shuts down once the last
/// initialization referring to it terminates.
static DEFAULT_RUNTIME: Mutex<Weak<Handle>> = Mutex::new(Weak::new());

/// A scoped reference to a scheduler.
///
/// Creating a `TaskSchedulerInit` binds the calling thread to a scheduler, dropping
/// it (or calling [`terminate`](Self::terminate)) releases that binding again.
/// Initializations nest: if the thread is already bound, a new initialization only
/// takes another reference and the requested number of threads is ignored.
///
/// Threads that are not bound yet attach to the process-wide default runtime, which
/// is created on first use and torn down once no initialization refers to it
/// anymore.
#[derive(Debug)]
pub struct TaskSchedulerInit {
    guard: Option<EnterGuard>,
}

impl TaskSchedulerInit {
    /// Initializes the scheduler for the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if the default runtime could not be created or has no room for another
    /// thread.
    pub fn new(num_threads: impl Into<NumThreads>) -> Result<Self, EnterError> {
        let mut init = Self::deferred();
        init.initialize(num_threads)?;
        Ok(init)
    }

    /// Returns an inactive initialization, to be activated with
    /// [`initialize`](Self::initialize).
    pub fn deferred() -> Self {
        Self { guard: None }
    }

    /// Activates a deferred initialization.
    ///
    /// # Errors
    ///
    /// See [`TaskSchedulerInit::new`].
    ///
    /// # Panics
    ///
    /// Panics if this initialization is already active.
    pub fn initialize(&mut self, num_threads: impl Into<NumThreads>) -> Result<(), EnterError> {
        assert!(!self.is_active(), "scheduler already initialized");

        let runtime = match Runtime::current() {
            Some(runtime) => runtime,
            None => default_runtime(num_threads.into())?,
        };
        self.guard = Some(runtime.enter()?);
        Ok(())
    }

    /// Releases this initialization's reference to the scheduler.
    ///
    /// # Panics
    ///
    /// Panics if this initialization is not active.
    pub fn terminate(&mut self) {
        assert!(self.is_active(), "scheduler not initialized");
        self.guard = None;
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    /// Returns the number of threads an automatically sized scheduler runs with.
    pub fn default_num_threads() -> usize {
        runtime::default_num_threads()
    }
}

fn default_runtime(num_threads: NumThreads) -> Result<Runtime, EnterError> {
    let mut slot = DEFAULT_RUNTIME.lock();
    if let Some(handle) = slot.upgrade() {
        return Ok(Runtime::from_handle(handle));
    }

    let runtime = Builder::new()
        .num_threads(num_threads)
        .thread_name("strand-default")
        .build()?;
    tracing::debug!(num_threads = runtime.num_threads(), "created default runtime");
    *slot = std::sync::Arc::downgrade(runtime.handle());
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::TaskGroup;
    use crate::test_util::{Concurrency, trace};
    use core::time::Duration;
    use std::sync::Arc;
    use std::thread;

    // the default runtime is process-wide, tests relying on its size must not overlap
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn default_runtime_is_gone() -> bool {
        DEFAULT_RUNTIME.lock().upgrade().is_none()
    }

    #[test]
    fn init_and_terminate_repeatedly() {
        let _trace = trace();
        let _serial = serial();

        for _ in 0..200 {
            let init = TaskSchedulerInit::new(2).unwrap();
            assert!(init.is_active());
            assert_eq!(Runtime::current().unwrap().num_threads(), 2);
            drop(init);
            assert!(Runtime::current().is_none());
        }
        assert!(default_runtime_is_gone());
    }

    #[test]
    fn nested_inits_share_the_runtime() {
        let _trace = trace();
        let _serial = serial();

        let outer = TaskSchedulerInit::new(2).unwrap();
        let rt = Runtime::current().unwrap();

        let mut inner = TaskSchedulerInit::new(8).unwrap();
        let nested = Runtime::current().unwrap();
        assert!(nested.ptr_eq(&rt));
        assert_eq!(nested.num_threads(), 2, "nested inits don't resize the runtime");

        inner.terminate();
        assert!(!inner.is_active());
        assert!(Runtime::current().is_some());

        drop(outer);
        assert!(Runtime::current().is_none());
        drop((rt, nested));
        assert!(default_runtime_is_gone());
    }

    #[test]
    fn deferred_initialization() {
        let _serial = serial();

        let mut init = TaskSchedulerInit::deferred();
        assert!(!init.is_active());
        assert!(Runtime::current().is_none());

        init.initialize(NumThreads::Automatic).unwrap();
        assert!(init.is_active());
        assert_eq!(
            Runtime::current().unwrap().num_threads(),
            TaskSchedulerInit::default_num_threads()
        );

        init.terminate();
        assert!(!init.is_active());
        init.initialize(1).unwrap();
        assert!(init.is_active());
    }

    #[test]
    #[should_panic = "scheduler already initialized"]
    fn initialize_twice_panics() {
        let _serial = serial();

        let mut init = TaskSchedulerInit::new(1).unwrap();
        let _ = init.initialize(1);
    }

    #[test]
    fn threads_share_the_default_runtime() {
        let _trace = trace();
        let _serial = serial();

        let init = TaskSchedulerInit::new(3).unwrap();
        let rt = Runtime::current().unwrap();

        let shared = thread::spawn(move || {
            let _init = TaskSchedulerInit::new(1).unwrap();
            Runtime::current().unwrap().ptr_eq(&rt)
        })
        .join()
        .unwrap();
        assert!(shared);
        drop(init);
    }

    fn peak_concurrency(num_threads: usize) -> usize {
        let _init = TaskSchedulerInit::new(num_threads).unwrap();
        let local = Arc::new(Concurrency::new());
        let group = TaskGroup::new();
        for _ in 0..64 {
            let local = local.clone();
            group.run(move || {
                let _inside = local.enter();
                thread::sleep(Duration::from_micros(200));
            });
        }
        group.wait().unwrap();
        local.peak()
    }

    #[test]
    fn single_thread_runs_one_task_at_a_time() {
        let _trace = trace();
        let _serial = serial();

        assert_eq!(peak_concurrency(1), 1);
    }

    #[test]
    fn concurrency_is_bounded_by_thread_count() {
        let _trace = trace();
        let _serial = serial();

        let peak = peak_concurrency(3);
        assert!((1..=3).contains(&peak));
    }
}
