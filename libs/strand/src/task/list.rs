// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::TaskRef;
use std::collections::VecDeque;

/// A batch of tasks that have not been spawned yet.
///
/// Spawning a list hands every task over to the scheduler and leaves the list empty.
#[derive(Debug, Default)]
pub struct TaskList {
    tasks: VecDeque<TaskRef>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task: TaskRef) {
        self.tasks.push_back(task);
    }

    pub fn pop_front(&mut self) -> Option<TaskRef> {
        self.tasks.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Drops all tasks from the list without spawning them.
    ///
    /// The tasks stay allocated, call [`TaskRef::destroy`] on them to release them.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.iter()
    }
}

impl FromIterator<TaskRef> for TaskList {
    fn from_iter<I: IntoIterator<Item = TaskRef>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}

impl Extend<TaskRef> for TaskList {
    fn extend<I: IntoIterator<Item = TaskRef>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}
