// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{BuildError, EnterError};
use crate::scheduler::{self, Arena, LocalScheduler};
use core::fmt;
use core::marker::PhantomData;
use std::borrow::Cow;
use std::sync::Arc;
use std::thread;

const DEFAULT_MAX_MASTERS: usize = 64;
const DEFAULT_STEAL_ROUNDS: usize = 4;

/// How many threads a runtime runs with, the thread that joins it included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumThreads {
    /// One thread per hardware thread, see [`default_num_threads`].
    #[default]
    Automatic,
    Exact(usize),
}

impl From<usize> for NumThreads {
    fn from(n: usize) -> Self {
        Self::Exact(n)
    }
}

/// Returns the number of threads [`NumThreads::Automatic`] resolves to.
pub fn default_num_threads() -> usize {
    thread::available_parallelism().map_or(1, usize::from)
}

/// Configures and creates a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Builder {
    num_threads: NumThreads,
    thread_name: Cow<'static, str>,
    stack_size: Option<usize>,
    max_masters: usize,
    steal_rounds: usize,
}

/// A pool of worker threads sharing an arena of task deques.
///
/// Worker threads live as long as the runtime (or any clone of it). Other threads take
/// part in the runtime by [entering](Runtime::enter) it.
#[derive(Clone)]
pub struct Runtime {
    handle: Arc<Handle>,
}

pub(crate) struct Handle {
    arena: Arc<Arena>,
}

/// Keeps the current thread bound to a runtime, see [`Runtime::enter`].
#[must_use = "the thread leaves the runtime when the guard is dropped"]
pub struct EnterGuard {
    _handle: Arc<Handle>,
    // the binding is thread-local
    _not_send: PhantomData<*const ()>,
}

// === impl Builder ===

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            num_threads: NumThreads::Automatic,
            thread_name: Cow::Borrowed("strand-worker"),
            stack_size: None,
            max_masters: DEFAULT_MAX_MASTERS,
            steal_rounds: DEFAULT_STEAL_ROUNDS,
        }
    }

    /// Sets the total concurrency, the thread that enters the runtime included.
    ///
    /// A runtime with `n` threads spawns `n - 1` workers.
    pub fn num_threads(mut self, num_threads: impl Into<NumThreads>) -> Self {
        self.num_threads = num_threads.into();
        self
    }

    /// Sets the name prefix of worker threads, they are suffixed with their index.
    pub fn thread_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets the stack size of worker threads.
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Sets how many non-worker threads may be entered into the runtime at once.
    pub fn max_masters(mut self, n: usize) -> Self {
        self.max_masters = n;
        self
    }

    /// Sets how many times an idle thread scans all deques before it parks.
    pub fn steal_rounds(mut self, n: usize) -> Self {
        self.steal_rounds = n;
        self
    }

    /// Creates the runtime and starts its worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ZeroThreads`] if the runtime would have no threads, and
    /// [`BuildError::Spawn`] if a worker thread could not be spawned.
    pub fn build(&self) -> Result<Runtime, BuildError> {
        let num_threads = match self.num_threads {
            NumThreads::Automatic => default_num_threads(),
            NumThreads::Exact(0) => return Err(BuildError::ZeroThreads),
            NumThreads::Exact(n) => n,
        };
        let num_workers = num_threads - 1;

        let arena = Arc::new(Arena::new(
            num_workers,
            self.max_masters,
            self.steal_rounds.max(1),
        ));
        let handle = Arc::new(Handle {
            arena: arena.clone(),
        });
        tracing::debug!(num_threads, max_masters = self.max_masters, "starting runtime");

        for slot in 0..num_workers {
            let mut builder = thread::Builder::new().name(format!("{}-{slot}", self.thread_name));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let weak = Arc::downgrade(&handle);
            let worker_arena = arena.clone();
            // on error `handle` is dropped, which stops the workers spawned so far
            let join = builder.spawn(move || scheduler::run_worker(worker_arena, slot, weak))?;
            arena.add_worker(join);
        }

        Ok(Runtime { handle })
    }
}

// === impl Runtime ===

impl Runtime {
    /// Creates a runtime with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Builder::build`].
    pub fn new() -> Result<Self, BuildError> {
        Builder::new().build()
    }

    /// Returns the runtime the current thread is bound to.
    pub fn current() -> Option<Self> {
        let handle = scheduler::current()?.handle().upgrade()?;
        Some(Self { handle })
    }

    /// Binds the current thread to this runtime until the returned guard is dropped.
    ///
    /// While bound, the thread can allocate, spawn and wait for tasks. Entering the
    /// runtime the thread is already bound to nests.
    ///
    /// # Errors
    ///
    /// Returns [`EnterError::BoundElsewhere`] if the thread is bound to a different
    /// runtime and [`EnterError::NoFreeSlot`] if the runtime has no room for another
    /// thread.
    pub fn enter(&self) -> Result<EnterGuard, EnterError> {
        LocalScheduler::enter(&self.handle)?;
        Ok(EnterGuard {
            _handle: self.handle.clone(),
            _not_send: PhantomData,
        })
    }

    /// Total number of threads, the joining thread included.
    pub fn num_threads(&self) -> usize {
        self.handle.arena.num_workers() + 1
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub(crate) fn from_handle(handle: Arc<Handle>) -> Self {
        Self { handle }
    }

    /// Returns `true` if both handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("num_threads", &self.num_threads())
            .finish_non_exhaustive()
    }
}

// === impl Handle ===

impl Handle {
    pub(crate) fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.arena.shutdown();
    }
}

// === impl EnterGuard ===

impl Drop for EnterGuard {
    fn drop(&mut self) {
        LocalScheduler::leave();
    }
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterGuard").finish_non_exhaustive()
    }
}
