// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Exception;
use crate::task::{Task, TaskRef};
use core::fmt;

/// A task that does nothing.
///
/// Useful as a continuation that only joins children, or as the dummy parent a thread
/// waits on.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyTask;

impl Task for EmptyTask {
    fn execute(&mut self, _this: &TaskRef) -> Result<Option<TaskRef>, Exception> {
        Ok(None)
    }
}

/// A task that runs a closure once.
pub struct FnTask<F> {
    f: Option<F>,
}

impl<F> FnTask<F>
where
    F: FnOnce() -> Result<(), Exception> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce() -> Result<(), Exception> + Send + 'static,
{
    fn execute(&mut self, _this: &TaskRef) -> Result<Option<TaskRef>, Exception> {
        debug_assert!(self.f.is_some(), "FnTask executed twice");
        if let Some(f) = self.f.take() {
            f()?;
        }
        Ok(None)
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("f", &core::any::type_name::<F>())
            .field("done", &self.f.is_none())
            .finish()
    }
}
