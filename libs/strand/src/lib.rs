// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A work-stealing scheduler for fork/join parallelism.
//!
//! Work is expressed as trees of [`Task`]s. A task spawns children, then either waits
//! for them ([`TaskRef::wait_for_all`]) or hands its remaining work to a continuation
//! that runs once the last child finished. Every thread bound to a [`Runtime`] owns a
//! deque of ready tasks, idle threads steal from the deques of busy ones.
//!
//! Tasks belong to [`TaskGroupContext`]s which can be cancelled as a whole, and the
//! first error (or panic) raised by a task in a group cancels the group and is handed
//! to whoever waits on its root.
//!
//! ```no_run
//! use strand::{TaskGroup, TaskSchedulerInit};
//!
//! let _init = TaskSchedulerInit::new(4).unwrap();
//! let group = TaskGroup::new();
//! for i in 0..8 {
//!     group.run(move || println!("hello from {i}"));
//! }
//! group.wait().unwrap();
//! ```

mod context;
mod error;
mod group;
mod init;
mod runtime;
mod scheduler;
mod sync;
pub mod task;
#[cfg(test)]
mod test_util;

pub use context::{ContextKind, TaskGroupContext};
pub use error::{BuildError, EnterError, Exception};
pub use group::{TaskGroup, TaskGroupStatus};
pub use init::TaskSchedulerInit;
pub use runtime::{Builder, EnterGuard, NumThreads, Runtime, default_num_threads};
pub use task::{
    AffinityId, Task, TaskList, TaskRef, TaskState, live_task_count, spawn, spawn_list,
    spawn_root_and_wait, spawn_root_and_wait_list,
};

static_assertions::assert_impl_all!(TaskGroupContext: Send, Sync);
static_assertions::assert_impl_all!(Exception: Send, Sync);
static_assertions::assert_impl_all!(Runtime: Send, Sync);
static_assertions::assert_not_impl_any!(EnterGuard: Send);
