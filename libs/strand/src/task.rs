// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task nodes and the operations user code drives them with.
//!
//! A task is a heap allocated node made up of scheduling metadata and
//! a user provided body implementing [`Task`]. User code refers to tasks through
//! [`TaskRef`] handles. Handles keep the node's memory alive, but the body's lifetime
//! follows the task protocol: it is dropped right after its last `execute` returns, or
//! when the task is explicitly [destroyed](TaskRef::destroy).
//!
//! # Reference counts
//!
//! Every task carries a signed reference count that tracks outstanding children. A task
//! waiting for `n` children sets its count to `n + 1` before spawning them; each child
//! that completes decrements its parent's count, and the waiting thread wakes up once
//! the count drops back to one. Continuations use the count without the extra one: the
//! child that drops it to zero runs the continuation.

mod builtin;
mod id;
mod list;

pub use builtin::{EmptyTask, FnTask};
pub use id::Id;
pub use list::TaskList;

use crate::context::TaskGroupContext;
use crate::error::Exception;
use crate::scheduler::{self, LocalScheduler};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strand_spin::{Atomic, Mutex};

/// Identifies the thread slot a task would like to run on, `0` means no preference.
pub type AffinityId = u16;

/// The body of a task.
pub trait Task: Send + 'static {
    /// Runs the task.
    ///
    /// `this` is the handle of the task being executed. It can be used to allocate
    /// children and continuations, to wait for children, or to recycle the task.
    ///
    /// Returning `Ok(Some(task))` asks the calling thread to run `task` next, bypassing
    /// the task deque. Returned errors are stored in the task's group context, which
    /// cancels the group and makes the thread waiting on the group's root fail with
    /// the error.
    fn execute(&mut self, this: &TaskRef) -> Result<Option<TaskRef>, Exception>;

    /// Called before `execute` when the task runs on a thread other than the one
    /// named by its affinity, or after it has been stolen.
    ///
    /// `id` is the affinity of the thread that is about to run the task.
    fn note_affinity(&mut self, id: AffinityId) {
        let _ = id;
    }
}

/// The scheduling states of a task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// `execute` is running.
    Executing = 0,
    /// Recycled with [`TaskRef::recycle_to_reexecute`], will be spawned again.
    Reexecute = 1,
    /// Sitting in a deque, waiting for a thread to pick it up.
    Ready = 2,
    /// Allocated or recycled, but not yet spawned.
    Allocated = 3,
    /// The body has been dropped.
    Freed = 4,
    /// Recycled with [`TaskRef::recycle_as_safe_continuation`].
    Recycle = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Executing,
            1 => Self::Reexecute,
            2 => Self::Ready,
            3 => Self::Allocated,
            4 => Self::Freed,
            5 => Self::Recycle,
            _ => unreachable!("invalid task state {v}"),
        }
    }
}

/// Counts the task nodes a scheduler allocated and that have not been freed yet.
#[derive(Debug, Default)]
pub(crate) struct TaskPool {
    live: AtomicUsize,
}

impl TaskPool {
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// The scheduling metadata of a task node.
pub(crate) struct Header {
    id: Id,
    state: Atomic<u8>,
    ref_count: Atomic<isize>,
    depth: Atomic<isize>,
    affinity: Atomic<u16>,
    /// Slot (+1) of the thread that allocated the task.
    origin: usize,
    /// Slot (+1) of the thread that last spawned or executed the task.
    owner: Atomic<usize>,
    /// Set while a thread is inside `execute`, catches protocol misuse that would let
    /// two threads run the same body.
    running: AtomicBool,
    parent: Mutex<Option<TaskRef>>,
    context: Mutex<TaskGroupContext>,
    pool: Arc<TaskPool>,
}

pub(crate) struct TaskCell<T: ?Sized> {
    header: Header,
    body: UnsafeCell<ManuallyDrop<T>>,
}

// Safety: the body is only accessed by the thread executing or freeing the task, which
// the state machine and the `running` flag make exclusive.
unsafe impl<T: ?Sized + Send> Send for TaskCell<T> {}
// Safety: see above
unsafe impl<T: ?Sized + Send> Sync for TaskCell<T> {}

/// A reference counted handle to a task node.
#[derive(Clone)]
pub struct TaskRef(Arc<TaskCell<dyn Task>>);

static_assertions::assert_impl_all!(TaskRef: Send, Sync);

// === impl TaskRef ===

impl TaskRef {
    /// Allocates a root task in a fresh group bound to the active group.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a scheduler.
    #[track_caller]
    pub fn allocate_root<T: Task>(body: T) -> TaskRef {
        Self::allocate_root_with(&TaskGroupContext::bound(), body)
    }

    /// Allocates a root task that belongs to `context`.
    ///
    /// A bound `context` that has not been used before is bound to the active group:
    /// the group of the innermost task executing on this thread, or the thread's
    /// default group.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a scheduler.
    #[track_caller]
    pub fn allocate_root_with<T: Task>(context: &TaskGroupContext, body: T) -> TaskRef {
        let sched = scheduler::expect_current();
        if !context.is_bound() {
            context.bind_to(Some(&sched.active_context()));
        }
        Self::allocate(&sched, body, None, 0, context.clone())
    }

    /// Allocates a child of this task.
    ///
    /// The reference count of `self` is left alone, the caller accounts for the child
    /// with [`TaskRef::set_ref_count`].
    #[track_caller]
    pub fn allocate_child<T: Task>(&self, body: T) -> TaskRef {
        let sched = scheduler::expect_current();
        Self::allocate(
            &sched,
            body,
            Some(self.clone()),
            self.depth() + 1,
            self.context(),
        )
    }

    /// Allocates a task that takes over this task's parent.
    ///
    /// After this call `self` has no parent anymore, the continuation completes
    /// towards it instead.
    #[track_caller]
    pub fn allocate_continuation<T: Task>(&self, body: T) -> TaskRef {
        let sched = scheduler::expect_current();
        let parent = self.header().parent.lock().take();
        Self::allocate(&sched, body, parent, self.depth(), self.context())
    }

    /// Allocates a child of `parent`, atomically accounting for it in `parent`'s
    /// reference count.
    ///
    /// Unlike [`TaskRef::allocate_child`] this may be used while `parent` already has
    /// running children.
    #[track_caller]
    pub fn allocate_additional_child_of<T: Task>(parent: &TaskRef, body: T) -> TaskRef {
        let sched = scheduler::expect_current();
        parent
            .header()
            .ref_count
            .fetch_and_add(1, Ordering::AcqRel);
        Self::allocate(
            &sched,
            body,
            Some(parent.clone()),
            parent.depth() + 1,
            parent.context(),
        )
    }

    pub(crate) fn allocate<T: Task>(
        sched: &LocalScheduler,
        body: T,
        parent: Option<TaskRef>,
        depth: isize,
        context: TaskGroupContext,
    ) -> TaskRef {
        let pool = sched.pool().clone();
        pool.live.fetch_add(1, Ordering::Relaxed);

        let cell = Arc::new(TaskCell {
            header: Header {
                id: Id::next(),
                state: Atomic::<u8>::new(TaskState::Allocated as u8),
                ref_count: Atomic::<isize>::new(0),
                depth: Atomic::<isize>::new(depth),
                affinity: Atomic::<u16>::new(0),
                origin: sched.slot_tag(),
                owner: Atomic::<usize>::new(sched.slot_tag()),
                running: AtomicBool::new(false),
                parent: Mutex::new(parent),
                context: Mutex::new(context),
                pool,
            },
            body: UnsafeCell::new(ManuallyDrop::new(body)),
        });

        TaskRef(cell)
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        &self.0.header
    }

    pub fn id(&self) -> Id {
        self.header().id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.header().state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.header().state.store(state as u8, Ordering::Release);
    }

    /// Moves the task from state `from` to `to`, returning the state it was in.
    ///
    /// The transition only happened if the returned state equals `from`.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> TaskState {
        TaskState::from_u8(self.header().state.compare_and_swap(
            to as u8,
            from as u8,
            Ordering::AcqRel,
        ))
    }

    /// The address of the task node, used to match waiters to the task they wait on.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>().addr()
    }

    pub fn ptr_eq(&self, other: &TaskRef) -> bool {
        self.addr() == other.addr()
    }

    /// Returns the innermost task executing on the calling thread.
    pub fn current() -> Option<TaskRef> {
        scheduler::current()?.innermost()
    }

    pub fn ref_count(&self) -> isize {
        self.header().ref_count.load(Ordering::Acquire)
    }

    /// Sets the reference count.
    ///
    /// Must not be called once the task has been spawned.
    #[track_caller]
    pub fn set_ref_count(&self, count: isize) {
        debug_assert!(count >= 0, "reference count must not be negative");
        debug_assert_ne!(
            self.state(),
            TaskState::Ready,
            "cannot set the reference count of a spawned task"
        );
        self.header().ref_count.store(count, Ordering::Release);
    }

    /// Atomically decrements the reference count and returns the new value.
    pub(crate) fn decrement_ref_count(&self) -> isize {
        let new = self.header().ref_count.fetch_and_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(new >= 0, "reference count underflow on task {}", self.id());
        new
    }

    pub fn depth(&self) -> isize {
        self.header().depth.load(Ordering::Relaxed)
    }

    #[track_caller]
    pub fn set_depth(&self, depth: isize) {
        debug_assert!(depth >= 0, "depth must not be negative");
        debug_assert_ne!(
            self.state(),
            TaskState::Ready,
            "cannot change the depth of a spawned task"
        );
        self.header().depth.store(depth, Ordering::Relaxed);
    }

    #[track_caller]
    pub fn add_to_depth(&self, delta: isize) {
        debug_assert_ne!(
            self.state(),
            TaskState::Ready,
            "cannot change the depth of a spawned task"
        );
        let new = self.header().depth.fetch_and_add(delta, Ordering::Relaxed) + delta;
        debug_assert!(new >= 0, "depth must not be negative");
    }

    pub fn parent(&self) -> Option<TaskRef> {
        self.header().parent.lock().clone()
    }

    pub(crate) fn take_parent(&self) -> Option<TaskRef> {
        self.header().parent.lock().take()
    }

    pub(crate) fn set_parent(&self, parent: Option<TaskRef>) {
        *self.header().parent.lock() = parent;
    }

    /// The group this task belongs to.
    pub fn context(&self) -> TaskGroupContext {
        self.header().context.lock().clone()
    }

    pub fn affinity(&self) -> AffinityId {
        self.header().affinity.load(Ordering::Relaxed)
    }

    pub fn set_affinity(&self, id: AffinityId) {
        self.header().affinity.store(id, Ordering::Relaxed);
    }

    pub(crate) fn owner(&self) -> usize {
        self.header().owner.load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner(&self, slot_tag: usize) {
        self.header().owner.store(slot_tag, Ordering::Relaxed);
    }

    /// Returns `true` if the calling thread owns the task.
    ///
    /// A task is owned by the thread that allocated it until it is spawned, and by
    /// the thread that spawned or executed it last afterwards.
    pub fn is_owned_by_current_thread(&self) -> bool {
        scheduler::current().is_some_and(|sched| self.owner() == sched.slot_tag())
    }

    /// Returns `true` if the task is executing on a different thread than the one that
    /// allocated it.
    pub fn is_stolen_task(&self) -> bool {
        self.header().owner.load(Ordering::Relaxed) != self.header().origin
    }

    /// Cancels the group this task belongs to.
    pub fn cancel_task_group(&self) -> bool {
        self.context().cancel_group_execution()
    }

    /// Returns `true` if the group this task belongs to has been cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.context().was_cancelled()
    }

    // --- recycling ---

    /// Turns the executing task into a continuation of its children.
    ///
    /// The task is not freed when `execute` returns. The caller must set the reference
    /// count and spawn children such that the task is not spawned again before
    /// `execute` returns; [`TaskRef::recycle_as_safe_continuation`] lifts that
    /// restriction.
    #[track_caller]
    pub fn recycle_as_continuation(&self) {
        debug_assert_eq!(
            self.state(),
            TaskState::Executing,
            "execute not running, or already recycled"
        );
        self.set_state(TaskState::Allocated);
    }

    /// Like [`TaskRef::recycle_as_continuation`], but the reference count must be set
    /// one higher. The scheduler drops the extra reference when `execute` returns, so
    /// children may complete before that.
    #[track_caller]
    pub fn recycle_as_safe_continuation(&self) {
        debug_assert_eq!(
            self.state(),
            TaskState::Executing,
            "execute not running, or already recycled"
        );
        self.set_state(TaskState::Recycle);
    }

    /// Turns the executing task into a fresh child of `new_parent`.
    #[track_caller]
    pub fn recycle_as_child_of(&self, new_parent: &TaskRef) {
        let state = self.state();
        debug_assert!(
            matches!(state, TaskState::Executing | TaskState::Allocated),
            "execute not running, or already recycled"
        );
        debug_assert_eq!(self.ref_count(), 0, "no child tasks allowed when recycled as a child");
        debug_assert!(self.parent().is_none(), "parent must be null");

        self.set_parent(Some(new_parent.clone()));
        self.header()
            .depth
            .store(new_parent.depth() + 1, Ordering::Relaxed);
        *self.header().context.lock() = new_parent.context();
        self.set_state(TaskState::Allocated);
    }

    /// Schedules the executing task to run again once `execute` returns.
    ///
    /// `execute` must return a bypass task other than itself.
    #[track_caller]
    pub fn recycle_to_reexecute(&self) {
        debug_assert_eq!(
            self.state(),
            TaskState::Executing,
            "execute not running, or already recycled"
        );
        debug_assert_eq!(
            self.ref_count(),
            0,
            "no child tasks allowed when recycled for reexecution"
        );
        self.set_state(TaskState::Reexecute);
    }

    /// Releases a task that was allocated but will never run.
    ///
    /// The task's parent reference count is decremented.
    ///
    /// # Panics
    ///
    /// Panics if the task is not in the [`TaskState::Allocated`] state.
    #[track_caller]
    pub fn destroy(self) {
        assert_eq!(
            self.state(),
            TaskState::Allocated,
            "only allocated tasks can be destroyed"
        );
        debug_assert_eq!(self.ref_count(), 0, "task destroyed with live children");

        if let Some(parent) = self.take_parent() {
            let remaining = parent.decrement_ref_count();
            if remaining == 1 {
                if let Some(sched) = scheduler::current() {
                    sched.notify_waiting_on(&parent);
                }
            }
        }
        self.free();
    }

    // --- waiting ---

    /// Waits until all children of this task completed.
    ///
    /// The reference count must have been set to the number of children plus one. Once
    /// the wait returns the count is zero.
    ///
    /// While waiting the thread executes other tasks.
    ///
    /// # Errors
    ///
    /// Returns the exception stored in this task's group if the group was cancelled
    /// because of it.
    #[track_caller]
    pub fn wait_for_all(&self) -> Result<(), Exception> {
        scheduler::expect_current().wait_for_all(self, None)
    }

    /// Spawns `child` and waits for all children of this task.
    ///
    /// The calling thread runs `child` itself, without going through its deque.
    ///
    /// # Errors
    ///
    /// See [`TaskRef::wait_for_all`].
    #[track_caller]
    pub fn spawn_and_wait_for_all(&self, child: TaskRef) -> Result<(), Exception> {
        scheduler::expect_current().wait_for_all(self, Some(child))
    }

    /// Spawns all tasks in `list` and waits for all children of this task.
    ///
    /// # Errors
    ///
    /// See [`TaskRef::wait_for_all`].
    #[track_caller]
    pub fn spawn_and_wait_for_all_list(&self, list: &mut TaskList) -> Result<(), Exception> {
        let sched = scheduler::expect_current();
        let first = list.pop_front();
        while let Some(task) = list.pop_front() {
            sched.spawn(task);
        }
        sched.wait_for_all(self, first)
    }

    // --- body access ---

    /// Runs `execute` (and `note_affinity` if requested) on the body.
    ///
    /// # Panics
    ///
    /// Panics if another thread is running the same body.
    pub(crate) fn run_body(
        &self,
        note_affinity: Option<AffinityId>,
    ) -> Result<Option<TaskRef>, Exception> {
        let was_running = self.header().running.swap(true, Ordering::Acquire);
        assert!(
            !was_running,
            "task {} spawned again while executing, recycle protocol violated",
            self.id()
        );

        struct Finish<'a>(&'a AtomicBool);
        impl Drop for Finish<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _finish = Finish(&self.header().running);

        // Safety: the `running` flag grants us exclusive access to the body, and it is
        // only dropped in `free` which requires the task to have left `execute`.
        let body = unsafe { &mut **self.0.body.get() };
        if let Some(id) = note_affinity {
            body.note_affinity(id);
        }
        body.execute(self)
    }

    /// Drops the body and returns the node to its pool.
    pub(crate) fn free(&self) {
        let prev = self
            .header()
            .state
            .fetch_and_store(TaskState::Freed as u8, Ordering::AcqRel);
        assert_ne!(prev, TaskState::Freed as u8, "task freed twice");
        assert!(
            !self.header().running.load(Ordering::Acquire),
            "task freed while executing"
        );

        // Safety: the state swap above makes this the only call that drops the body,
        // and the body is not borrowed by anyone since the task is not running.
        unsafe { ManuallyDrop::drop(&mut *self.0.body.get()) };
        self.header().pool.live.fetch_sub(1, Ordering::Release);
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Drop for TaskCell<T> {
    fn drop(&mut self) {
        if self.header.state.load(Ordering::Acquire) != TaskState::Freed as u8 {
            // allocated but never run nor destroyed
            // Safety: we have exclusive access, nobody else can drop the body
            unsafe { ManuallyDrop::drop(self.body.get_mut()) };
            self.header.pool.live.fetch_sub(1, Ordering::Release);
        }
    }
}

// === spawning ===

/// Makes `task` available for execution.
///
/// The task is pushed onto the calling thread's deque, idle threads may steal it from
/// there.
///
/// # Panics
///
/// Panics if the task is not in the [`TaskState::Allocated`] state or the calling
/// thread is not bound to a scheduler.
#[track_caller]
pub fn spawn(task: TaskRef) {
    scheduler::expect_current().spawn(task);
}

/// Spawns every task in `list`, leaving it empty.
#[track_caller]
pub fn spawn_list(list: &mut TaskList) {
    let sched = scheduler::expect_current();
    while let Some(task) = list.pop_front() {
        sched.spawn(task);
    }
}

/// Runs the root task `root` and waits for it and all of its descendants.
///
/// `root` must have been allocated on the calling thread and must not have a parent.
///
/// # Errors
///
/// Returns the exception stored in the root's group, if the group was cancelled
/// because of one.
#[track_caller]
pub fn spawn_root_and_wait(root: TaskRef) -> Result<(), Exception> {
    let sched = scheduler::expect_current();
    debug_assert!(root.parent().is_none(), "root task must not have a parent");
    debug_assert!(
        root.is_owned_by_current_thread(),
        "root task {} not owned by the current thread",
        root.id()
    );

    let dummy = TaskRef::allocate(&sched, EmptyTask, None, root.depth(), root.context());
    dummy.set_ref_count(2);
    root.set_parent(Some(dummy.clone()));

    let res = sched.wait_for_all(&dummy, Some(root));
    dummy.destroy();
    res
}

/// Runs all root tasks in `list` and waits for them and their descendants.
///
/// The first task runs on the calling thread, the rest are spawned in list order.
///
/// # Errors
///
/// Returns the first exception found when walking the roots' groups in list order.
#[track_caller]
pub fn spawn_root_and_wait_list(list: &mut TaskList) -> Result<(), Exception> {
    let Some(first) = list.pop_front() else {
        return Ok(());
    };
    let sched = scheduler::expect_current();
    debug_assert!(
        first.is_owned_by_current_thread() && list.iter().all(TaskRef::is_owned_by_current_thread),
        "root tasks not owned by the current thread"
    );

    let mut contexts = vec![first.context()];
    for root in list.iter() {
        let ctx = root.context();
        if !contexts.iter().any(|c| c.ptr_eq(&ctx)) {
            contexts.push(ctx);
        }
    }

    let dummy = TaskRef::allocate(&sched, EmptyTask, None, first.depth(), first.context());
    let count = isize::try_from(list.len() + 2).unwrap_or(isize::MAX);
    dummy.set_ref_count(count);

    first.set_parent(Some(dummy.clone()));
    while let Some(root) = list.pop_front() {
        debug_assert!(root.parent().is_none(), "root task must not have a parent");
        root.set_parent(Some(dummy.clone()));
        sched.spawn(root);
    }

    let res = sched.wait_for_all(&dummy, Some(first));
    dummy.destroy();
    res?;

    contexts
        .iter()
        .filter(|ctx| ctx.was_cancelled())
        .find_map(TaskGroupContext::exception)
        .map_or(Ok(()), Err)
}

/// Returns the number of task nodes allocated by the calling thread that have not
/// been freed yet.
///
/// Returns zero if the thread is not bound to a scheduler.
pub fn live_task_count() -> usize {
    scheduler::current().map_or(0, |sched| sched.pool().live())
}
