// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread half of the scheduler.
//!
//! Every thread that takes part in a runtime, worker or not, owns a [`LocalScheduler`]
//! bound to a slot of the runtime's [`Arena`]. The scheduler is reachable through a
//! thread-local, so task code never has to pass it around.

mod arena;
mod deque;

pub(crate) use arena::Arena;

use crate::context::TaskGroupContext;
use crate::error::{EnterError, Exception};
use crate::runtime::Handle;
use crate::sync::Waiter;
use crate::task::{AffinityId, TaskPool, TaskRef, TaskState};
use core::cell::{Cell, RefCell};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// Cookie idle threads park with, threads waiting for a task use its address.
const IDLE_COOKIE: usize = 0;

std::thread_local! {
    static CURRENT: RefCell<Option<Rc<LocalScheduler>>> = const { RefCell::new(None) };
}

/// Returns the scheduler bound to the calling thread.
pub(crate) fn current() -> Option<Rc<LocalScheduler>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Returns the scheduler bound to the calling thread.
///
/// # Panics
///
/// Panics if the thread is not bound to a scheduler.
#[track_caller]
pub(crate) fn expect_current() -> Rc<LocalScheduler> {
    match current() {
        Some(sched) => sched,
        None => panic!(
            "thread is not bound to a scheduler, create a `TaskSchedulerInit` or enter a `Runtime` first"
        ),
    }
}

#[derive(Debug)]
pub(crate) struct LocalScheduler {
    arena: Arc<Arena>,
    slot: usize,
    pool: Arc<TaskPool>,
    /// Parent of bound contexts created while no task runs on this thread.
    default_context: TaskGroupContext,
    innermost: RefCell<Option<TaskRef>>,
    waiter: Arc<Waiter>,
    rng: RefCell<SmallRng>,
    /// Nesting depth of `enter` calls on a master thread.
    enters: Cell<usize>,
    is_worker: bool,
    handle: Weak<Handle>,
}

// === impl LocalScheduler ===

impl LocalScheduler {
    fn new(arena: Arc<Arena>, slot: usize, is_worker: bool, handle: Weak<Handle>) -> Self {
        Self {
            arena,
            slot,
            pool: Arc::new(TaskPool::default()),
            default_context: TaskGroupContext::isolated(),
            innermost: RefCell::new(None),
            waiter: Waiter::new(),
            rng: RefCell::new(SmallRng::seed_from_u64(
                0x9e37_79b9_7f4a_7c15 ^ u64::try_from(slot).unwrap_or_default(),
            )),
            enters: Cell::new(0),
            is_worker,
            handle,
        }
    }

    /// Binds the calling thread to a master slot of `handle`'s arena.
    ///
    /// Entering the arena the thread is already bound to only bumps a counter.
    pub(crate) fn enter(handle: &Arc<Handle>) -> Result<(), EnterError> {
        if let Some(sched) = current() {
            if !Arc::ptr_eq(&sched.arena, handle.arena()) {
                return Err(EnterError::BoundElsewhere);
            }
            sched.enters.set(sched.enters.get() + 1);
            return Ok(());
        }

        let arena = handle.arena().clone();
        let slot = arena.claim_master_slot().ok_or(EnterError::NoFreeSlot)?;
        let sched = Rc::new(Self::new(arena, slot, false, Arc::downgrade(handle)));
        sched.enters.set(1);
        CURRENT.with(|current| *current.borrow_mut() = Some(sched));
        Ok(())
    }

    /// Undoes one `enter`, unbinding the thread when the last one is undone.
    ///
    /// Tasks that are still sitting in the thread's deque are executed first.
    pub(crate) fn leave() {
        let Some(sched) = current() else {
            return;
        };
        debug_assert!(!sched.is_worker, "worker threads never leave their arena");

        let enters = sched.enters.get() - 1;
        sched.enters.set(enters);
        if enters > 0 {
            return;
        }

        sched.flush();
        sched.arena.release_slot(sched.slot);
        tracing::debug!(slot = sched.slot, "master thread left arena");
        CURRENT.with(|current| current.borrow_mut().take());
    }

    pub(crate) fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    pub(crate) fn handle(&self) -> &Weak<Handle> {
        &self.handle
    }

    /// The slot index plus one, zero stands for "no thread".
    pub(crate) fn slot_tag(&self) -> usize {
        self.slot + 1
    }

    fn affinity_id(&self) -> AffinityId {
        AffinityId::try_from(self.slot_tag()).unwrap_or(AffinityId::MAX)
    }

    pub(crate) fn innermost(&self) -> Option<TaskRef> {
        self.innermost.borrow().clone()
    }

    /// The group new bound contexts attach to.
    pub(crate) fn active_context(&self) -> TaskGroupContext {
        self.innermost
            .borrow()
            .as_ref()
            .map_or_else(|| self.default_context.clone(), TaskRef::context)
    }

    // --- spawning ---

    /// Transitions `task` from allocated to ready.
    #[track_caller]
    fn make_ready(task: &TaskRef) {
        let prev = task.transition(TaskState::Allocated, TaskState::Ready);
        assert_eq!(
            prev,
            TaskState::Allocated,
            "task {} spawned twice, or spawned after it was freed",
            task.id()
        );
    }

    pub(crate) fn spawn(&self, task: TaskRef) {
        Self::make_ready(&task);
        self.push_ready(task);
    }

    fn push_ready(&self, task: TaskRef) {
        tracing::trace!(slot = self.slot, task.id = %task.id(), "spawning task");
        task.set_owner(self.slot_tag());
        // Safety: `LocalScheduler` is not `Send`, so we are on the thread owning `slot`
        unsafe { self.arena.deque(self.slot).push(task) };
        self.arena.monitor().notify_one();
    }

    fn pop_local(&self) -> Option<TaskRef> {
        // Safety: `LocalScheduler` is not `Send`, so we are on the thread owning `slot`
        unsafe { self.arena.deque(self.slot).pop() }
    }

    fn steal(&self) -> Option<TaskRef> {
        let mut rng = self.rng.borrow_mut();
        self.arena.steal(self.slot, &mut rng)
    }

    /// Wakes the thread waiting for `parent`'s children, if any.
    pub(crate) fn notify_waiting_on(&self, parent: &TaskRef) {
        let cookie = parent.addr();
        self.arena.monitor().notify(|c| c == cookie);
    }

    // --- executing ---

    /// Runs `task` and handles its post-execute state.
    ///
    /// Returns the task the caller should run next.
    fn execute(&self, task: TaskRef, stolen: bool) -> Option<TaskRef> {
        let prev = task.transition(TaskState::Ready, TaskState::Executing);
        assert_eq!(
            prev,
            TaskState::Ready,
            "task {} executed without being spawned",
            task.id()
        );
        task.set_owner(self.slot_tag());

        let context = task.context();
        let result = if context.was_cancelled() {
            tracing::trace!(task.id = %task.id(), "skipping task of cancelled group");
            Ok(None)
        } else {
            let me = self.affinity_id();
            let affinity = task.affinity();
            let note_affinity = (affinity != me && (affinity != 0 || stolen)).then_some(me);

            let outer = self.innermost.replace(Some(task.clone()));
            let result = panic::catch_unwind(AssertUnwindSafe(|| task.run_body(note_affinity)))
                .unwrap_or_else(|payload| Err(Exception::from_panic(payload)));
            *self.innermost.borrow_mut() = outer;
            result
        };

        let (mut bypass, failed) = match result {
            Ok(bypass) => (bypass, false),
            Err(exception) => {
                tracing::debug!(task.id = %task.id(), %exception, "task failed");
                context.register_exception(exception);
                (None, true)
            }
        };
        // read before readying the bypass, which may be the task itself
        let state = task.state();
        if let Some(next) = &bypass {
            Self::make_ready(next);
        }

        match state {
            TaskState::Executing => self.finish(&task, &mut bypass),
            TaskState::Recycle => {
                task.set_state(TaskState::Allocated);
                if task.decrement_ref_count() == 0 {
                    Self::make_ready(&task);
                    self.run_next(task, &mut bypass);
                }
            }
            TaskState::Allocated => {
                // recycled as continuation or child, someone else spawns it
            }
            TaskState::Reexecute if failed => {
                // there is no bypass to hand over to, the failure ends the task
                self.finish(&task, &mut bypass);
            }
            TaskState::Reexecute => {
                debug_assert!(
                    bypass.as_ref().is_some_and(|next| !next.ptr_eq(&task)),
                    "a task recycled for reexecution must return a different bypass task"
                );
                task.set_state(TaskState::Allocated);
                self.spawn(task);
            }
            state @ (TaskState::Ready | TaskState::Freed) => {
                unreachable!("task {} in state {state:?} after execute", task.id());
            }
        }

        bypass
    }

    /// Frees the finished `task` and reports its completion to its parent.
    fn finish(&self, task: &TaskRef, bypass: &mut Option<TaskRef>) {
        let parent = task.take_parent();
        task.free();
        if let Some(parent) = parent {
            self.complete_child_of(parent, bypass);
        }
    }

    /// Accounts for a completed child of `parent`.
    fn complete_child_of(&self, parent: TaskRef, bypass: &mut Option<TaskRef>) {
        match parent.decrement_ref_count() {
            0 if parent.state() == TaskState::Allocated => {
                // a continuation whose last child just finished
                Self::make_ready(&parent);
                self.run_next(parent, bypass);
            }
            1 => self.notify_waiting_on(&parent),
            _ => {}
        }
    }

    /// Makes the ready task `task` the bypass task, or spawns it if there already is one.
    fn run_next(&self, task: TaskRef, bypass: &mut Option<TaskRef>) {
        if bypass.is_none() {
            *bypass = Some(task);
        } else {
            self.push_ready(task);
        }
    }

    /// Runs `first` and every bypass task it returns.
    fn run_chain(&self, first: TaskRef, stolen: bool) {
        let mut next = self.execute(first, stolen);
        while let Some(task) = next {
            next = self.execute(task, false);
        }
    }

    /// Runs tasks until `parent`'s reference count drops to one.
    ///
    /// `first` is run before anything else, without going through the deque.
    pub(crate) fn wait_for_all(
        &self,
        parent: &TaskRef,
        first: Option<TaskRef>,
    ) -> Result<(), Exception> {
        let _span = tracing::trace_span!("wait_for_all", task.id = %parent.id()).entered();
        debug_assert_eq!(
            parent.owner(),
            self.slot_tag(),
            "task {} waited on by a thread that does not own it",
            parent.id()
        );

        if let Some(first) = first {
            Self::make_ready(&first);
            self.run_chain(first, false);
        }

        while parent.ref_count() > 1 {
            if let Some(task) = self.pop_local() {
                self.run_chain(task, false);
            } else if let Some(task) = self.steal() {
                self.run_chain(task, true);
            } else {
                self.park(parent.addr(), || {
                    parent.ref_count() <= 1 || self.arena.has_work()
                });
            }
        }

        parent.set_ref_count(0);

        let context = parent.context();
        if context.was_cancelled() {
            if let Some(exception) = context.exception() {
                return Err(exception);
            }
        }
        Ok(())
    }

    /// Parks the thread on the arena monitor unless `ready` turns true in the meantime.
    fn park(&self, cookie: usize, ready: impl Fn() -> bool) {
        let monitor = self.arena.monitor();
        monitor.prepare_wait(&self.waiter, cookie);
        if ready() || self.arena.is_stopping() {
            monitor.cancel_wait(&self.waiter);
        } else {
            tracing::trace!(slot = self.slot, cookie, "parking");
            monitor.commit_wait(&self.waiter);
            tracing::trace!(slot = self.slot, "woke up");
        }
    }

    /// Runs everything left in this thread's deque.
    fn flush(&self) {
        while let Some(task) = self.pop_local() {
            self.run_chain(task, false);
        }
    }

    /// The main loop of a worker thread.
    fn run(&self) {
        loop {
            if let Some(task) = self.pop_local() {
                self.run_chain(task, false);
                continue;
            }
            if let Some(task) = self.steal() {
                self.run_chain(task, true);
                continue;
            }

            if self.arena.is_stopping() {
                tracing::debug!(slot = self.slot, "stop signal received, shutting down");
                break;
            }

            self.park(IDLE_COOKIE, || self.arena.has_work());
        }
    }
}

/// Entry point of a worker thread bound to `slot`.
pub(crate) fn run_worker(arena: Arc<Arena>, slot: usize, handle: Weak<Handle>) {
    let _span = tracing::debug_span!("worker", slot).entered();

    arena.occupy_worker_slot(slot);
    let sched = Rc::new(LocalScheduler::new(arena, slot, true, handle));
    CURRENT.with(|current| *current.borrow_mut() = Some(sched.clone()));

    sched.run();

    CURRENT.with(|current| current.borrow_mut().take());
}
