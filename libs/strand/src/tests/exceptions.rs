// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Fail, Leaf};
use crate::context::TaskGroupContext;
use crate::error::Exception;
use crate::task::{
    EmptyTask, FnTask, Task, TaskList, TaskRef, live_task_count, spawn_root_and_wait,
    spawn_root_and_wait_list,
};
use crate::test_util::{runtime, trace};
use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, PartialEq, Eq)]
struct OutOfRange(u32);

impl fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is out of range", self.0)
    }
}

fn fn_root<F>(f: F) -> TaskRef
where
    F: FnOnce() -> Result<(), Exception> + Send + 'static,
{
    TaskRef::allocate_root(FnTask::new(f))
}

#[test]
fn panic_is_captured() {
    let _trace = trace();
    let (_rt, _guard) = runtime(2);

    let err = spawn_root_and_wait(fn_root(|| panic!("boom"))).unwrap_err();
    assert_eq!(err.name(), "panic");
    assert_eq!(err.what(), "boom");
    assert!(!err.is_movable());
    assert_eq!(live_task_count(), 0);
}

#[test]
fn movable_exception_keeps_its_payload() {
    let _trace = trace();
    let (_rt, _guard) = runtime(2);

    let err =
        spawn_root_and_wait(fn_root(|| Err(Exception::movable(OutOfRange(7))))).unwrap_err();
    assert!(err.is_movable());
    assert_eq!(err.downcast_ref::<OutOfRange>(), Some(&OutOfRange(7)));
    assert_eq!(err.what(), "7 is out of range");
}

#[test]
fn thrown_exception_survives_unwinding() {
    let _trace = trace();
    let (_rt, _guard) = runtime(2);

    let err = spawn_root_and_wait(fn_root(|| Exception::movable(OutOfRange(3)).throw()))
        .unwrap_err();
    assert_eq!(err.downcast_ref::<OutOfRange>(), Some(&OutOfRange(3)));
}

#[test]
fn std_errors_convert_with_question_mark() {
    let (_rt, _guard) = runtime(1);

    let err = spawn_root_and_wait(fn_root(|| {
        let n: u32 = "not a number".parse()?;
        assert_eq!(n, 0);
        Ok(())
    }))
    .unwrap_err();
    assert!(err.name().contains("ParseIntError"));
}

/// Spawns `n` failing children and waits for them.
struct ManyFail {
    n: usize,
}

impl Task for ManyFail {
    fn execute(&mut self, this: &TaskRef) -> Result<Option<TaskRef>, Exception> {
        let mut list: TaskList = (0..self.n)
            .map(|tag| this.allocate_child(Fail { tag }))
            .collect();
        this.set_ref_count(isize::try_from(self.n).unwrap() + 1);
        this.spawn_and_wait_for_all_list(&mut list)?;
        Ok(None)
    }
}

#[test]
fn first_exception_wins() {
    let _trace = trace();
    let (_rt, _guard) = runtime(4);

    for _ in 0..20 {
        let ctx = TaskGroupContext::bound();
        let root = TaskRef::allocate_root_with(&ctx, ManyFail { n: 8 });
        let err = spawn_root_and_wait(root).unwrap_err();

        assert_eq!(err.name(), "Fail");
        let tag: usize = err.what().parse().unwrap();
        assert!(tag < 8);
        assert!(ctx.was_cancelled());
        assert!(ctx.exception().unwrap().ptr_eq(&err));
    }
    assert_eq!(live_task_count(), 0);
}

#[test]
fn isolated_failure_does_not_cancel_siblings() {
    let _trace = trace();
    let (_rt, _guard) = runtime(4);

    let hits = Arc::new(AtomicUsize::new(0));
    let caught = Arc::new(AtomicUsize::new(0));
    let outer = TaskGroupContext::bound();

    let mut roots = TaskList::new();
    {
        let caught = caught.clone();
        roots.push_back(TaskRef::allocate_root_with(
            &outer,
            FnTask::new(move || {
                let isolated = TaskGroupContext::isolated();
                let inner = TaskRef::allocate_root_with(&isolated, Fail { tag: 1 });
                if spawn_root_and_wait(inner).is_err() {
                    caught.fetch_add(1, Ordering::Relaxed);
                }
                assert!(isolated.was_cancelled());
                Ok(())
            }),
        ));
    }
    for _ in 0..16 {
        roots.push_back(TaskRef::allocate_root_with(&outer, Leaf::new(&hits)));
    }

    spawn_root_and_wait_list(&mut roots).unwrap();
    assert_eq!(caught.load(Ordering::Relaxed), 1);
    assert_eq!(hits.load(Ordering::Relaxed), 16);
    assert!(!outer.was_cancelled());
}

#[test]
fn bound_failure_propagates_when_rethrown() {
    let _trace = trace();
    let (_rt, _guard) = runtime(4);

    let outer = TaskGroupContext::bound();
    let root = TaskRef::allocate_root_with(
        &outer,
        FnTask::new(|| {
            let inner = TaskRef::allocate_root(Fail { tag: 9 });
            let inner_ctx = inner.context();
            let res = spawn_root_and_wait(inner);
            assert!(inner_ctx.parent().is_some());
            res
        }),
    );

    let err = spawn_root_and_wait(root).unwrap_err();
    assert_eq!(err.what(), "9");
    assert!(outer.was_cancelled());
}

#[test]
fn cancelling_the_outer_group_cancels_nested_roots() {
    let _trace = trace();
    let (_rt, _guard) = runtime(2);

    let outer = TaskGroupContext::bound();
    let hits = Arc::new(AtomicUsize::new(0));
    let nested_cancelled = Arc::new(AtomicUsize::new(0));

    let root = {
        let hits = hits.clone();
        let nested_cancelled = nested_cancelled.clone();
        TaskRef::allocate_root_with(
            &outer,
            FnTask::new(move || {
                let this = TaskRef::current().expect("running inside a task");
                this.cancel_task_group();

                // bound below a cancelled group, so nothing in it runs
                let inner = TaskRef::allocate_root(Leaf::new(&hits));
                if inner.was_cancelled() {
                    nested_cancelled.fetch_add(1, Ordering::Relaxed);
                }
                spawn_root_and_wait(inner)
            }),
        )
    };

    // cancellation without an exception is not an error
    spawn_root_and_wait(root).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    assert_eq!(nested_cancelled.load(Ordering::Relaxed), 1);
}

#[test]
fn list_wait_reports_exception_of_any_root() {
    let _trace = trace();
    let (_rt, _guard) = runtime(3);

    let hits = Arc::new(AtomicUsize::new(0));
    let mut roots = TaskList::new();
    roots.push_back(TaskRef::allocate_root(Leaf::new(&hits)));
    roots.push_back(TaskRef::allocate_root(Fail { tag: 2 }));
    roots.push_back(TaskRef::allocate_root(Leaf::new(&hits)));

    let err = spawn_root_and_wait_list(&mut roots).unwrap_err();
    assert_eq!(err.what(), "2");
    assert_eq!(hits.load(Ordering::Relaxed), 2);
}

#[test]
fn cancelled_context_skips_bodies() {
    let (_rt, _guard) = runtime(1);

    let hits = Arc::new(AtomicUsize::new(0));
    let ctx = TaskGroupContext::bound();
    let root = TaskRef::allocate_root_with(&ctx, EmptyTask);
    root.set_ref_count(11);
    for _ in 0..10 {
        crate::task::spawn(root.allocate_child(Leaf::new(&hits)));
    }
    assert!(root.cancel_task_group());
    assert!(!root.cancel_task_group());

    root.wait_for_all().unwrap();
    root.destroy();
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    assert_eq!(live_task_count(), 0);
}
