// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::TaskGroupContext;
use crate::error::Exception;
use crate::scheduler;
use crate::task::{self, EmptyTask, FnTask, TaskRef};

/// How a [`TaskGroup::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroupStatus {
    /// Every closure ran.
    Complete,
    /// The group was cancelled, some closures may not have run.
    Canceled,
}

/// Runs closures in parallel and waits for all of them.
///
/// All closures run in the group's context, so [`cancel`](TaskGroup::cancel) or a
/// failing closure skips the closures that have not started yet.
#[derive(Debug)]
pub struct TaskGroup {
    root: TaskRef,
    context: TaskGroupContext,
}

impl TaskGroup {
    /// Creates a group in a fresh context bound to the active group.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a scheduler.
    pub fn new() -> Self {
        Self::with_context(TaskGroupContext::bound())
    }

    /// Creates a group that runs its closures in `context`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a scheduler.
    pub fn with_context(context: TaskGroupContext) -> Self {
        let root = TaskRef::allocate_root_with(&context, EmptyTask);
        root.set_ref_count(1);
        Self { root, context }
    }

    /// Spawns `f` as part of the group.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_run(move || {
            f();
            Ok(())
        });
    }

    /// Spawns a fallible `f` as part of the group.
    ///
    /// An error returned by `f` cancels the group and is returned from
    /// [`wait`](TaskGroup::wait).
    pub fn try_run<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), Exception> + Send + 'static,
    {
        let task = TaskRef::allocate_additional_child_of(&self.root, FnTask::new(f));
        task::spawn(task);
    }

    /// Waits for all closures spawned so far.
    ///
    /// Afterwards the group can be reused, a cancellation is reset.
    ///
    /// # Errors
    ///
    /// Returns the first error (or panic) raised by one of the closures.
    pub fn wait(&self) -> Result<TaskGroupStatus, Exception> {
        let res = scheduler::expect_current().wait_for_all(&self.root, None);
        self.root.set_ref_count(1);

        let cancelled = self.context.was_cancelled();
        self.context.reset();
        res?;

        Ok(if cancelled {
            TaskGroupStatus::Canceled
        } else {
            TaskGroupStatus::Complete
        })
    }

    /// Cancels the group. Closures that have not started yet are skipped.
    pub fn cancel(&self) {
        self.context.cancel_group_execution();
    }

    pub fn is_canceling(&self) -> bool {
        self.context.was_cancelled()
    }

    pub fn context(&self) -> &TaskGroupContext {
        &self.context
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if self.root.ref_count() > 1 && scheduler::current().is_some() {
            if let Err(exception) = self.wait() {
                tracing::warn!(%exception, "task group dropped with unobserved exception");
            }
        }

        self.root.set_ref_count(0);
        self.root.clone().destroy();
    }
}
