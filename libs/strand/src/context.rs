// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation groups.
//!
//! Every root task belongs to a [`TaskGroupContext`], and every task allocated below
//! it inherits the same context. Contexts form a tree: a *bound* context is linked as
//! a child of the context that was active when its first root task was allocated, an
//! *isolated* context has no parent.
//!
//! Cancelling a context cancels its whole bound subtree. Tasks of a cancelled context
//! are skipped by the scheduler, and running tasks can poll
//! [`TaskGroupContext::was_cancelled`] to exit early.

use crate::error::Exception;
use cordyceps::{Linked, List, list};
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strand_spin::{Mutex, RwLock};

/// How a context relates to the context active at its creation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Cancellation and exceptions flow down from the parent context.
    Bound,
    /// Never affected by, and never affects, any other context.
    Isolated,
}

/// A node in the tree of cancellation groups.
///
/// Cloning a context yields another handle to the same group.
#[derive(Clone)]
pub struct TaskGroupContext(Arc<ContextInner>);

struct ContextInner {
    /// Links into the parent's `children` list.
    links: list::Links<ContextInner>,
    kind: ContextKind,
    /// Set once the context has been attached to its parent (or decided it has none).
    bound: AtomicBool,
    /// Strong reference, a parent always outlives its children.
    parent: Mutex<Option<TaskGroupContext>>,
    /// Non-owning, children remove themselves when they are dropped.
    children: Mutex<List<ContextInner>>,
    cancellation_requested: AtomicBool,
    /// Read by every waiter of the group, written at most once per failure.
    exception: RwLock<Option<Exception>>,
}

// Safety: the intrusive links are only touched while holding the owning parent's
// `children` lock, every other field is synchronized on its own.
unsafe impl Send for ContextInner {}
// Safety: see above
unsafe impl Sync for ContextInner {}

// === impl TaskGroupContext ===

impl TaskGroupContext {
    pub fn new(kind: ContextKind) -> Self {
        Self(Arc::new(ContextInner {
            links: list::Links::new(),
            kind,
            bound: AtomicBool::new(false),
            parent: Mutex::new(None),
            children: Mutex::new(List::new()),
            cancellation_requested: AtomicBool::new(false),
            exception: RwLock::new(None),
        }))
    }

    /// Creates a context that is bound to the active context on first use.
    pub fn bound() -> Self {
        Self::new(ContextKind::Bound)
    }

    /// Creates a context that never takes part in cancellation of other groups.
    pub fn isolated() -> Self {
        Self::new(ContextKind::Isolated)
    }

    pub fn kind(&self) -> ContextKind {
        self.0.kind
    }

    /// Requests cancellation of this group and every group bound below it.
    ///
    /// Returns `true` if this call was the one that flipped the flag, `false` if the
    /// group was already cancelled.
    pub fn cancel_group_execution(&self) -> bool {
        if self.0.cancellation_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(context = ?self, "cancelling task group");

        propagate_cancellation(&self.0);
        true
    }

    /// Returns `true` if this group has been cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.0.cancellation_requested.load(Ordering::Acquire)
    }

    /// Returns a clone of the exception stored in this group, if any.
    pub fn exception(&self) -> Option<Exception> {
        self.0.exception.read().clone()
    }

    /// Stores `exception` unless the group already holds one, then cancels the group.
    ///
    /// Returns `true` if `exception` was stored.
    pub fn register_exception(&self, exception: Exception) -> bool {
        let stored = {
            let mut slot = self.0.exception.write();
            if slot.is_none() {
                *slot = Some(exception);
                true
            } else {
                false
            }
        };
        if !stored {
            tracing::trace!(context = ?self, "dropping exception, group already holds one");
        }
        self.cancel_group_execution();
        stored
    }

    /// Clears the cancellation flag and any stored exception.
    ///
    /// Only meaningful once no task of this group is running anymore. Bound children
    /// are not reset.
    pub fn reset(&self) {
        *self.0.exception.write() = None;
        self.0.cancellation_requested.store(false, Ordering::Release);
    }

    /// Returns `true` if both handles refer to the same group.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns the context this one is bound to.
    pub fn parent(&self) -> Option<TaskGroupContext> {
        self.0.parent.lock().clone()
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.0.bound.load(Ordering::Acquire)
    }

    pub(crate) fn num_children(&self) -> usize {
        self.0.children.lock().len()
    }

    /// Attaches this context below `parent`.
    ///
    /// Isolated contexts and contexts that are already attached ignore the call. A
    /// context attached below a cancelled parent starts out cancelled.
    pub(crate) fn bind_to(&self, parent: Option<&TaskGroupContext>) {
        if self.is_bound() {
            return;
        }

        let mut parent_slot = self.0.parent.lock();
        if self.0.bound.load(Ordering::Relaxed) {
            return;
        }

        if let (ContextKind::Bound, Some(parent)) = (self.0.kind, parent) {
            debug_assert!(!self.ptr_eq(parent), "context cannot be bound to itself");

            let mut siblings = parent.0.children.lock();
            siblings.push_back(NonNull::from(&*self.0));
            // read under the lock, a concurrent cancellation either sees us in the
            // list or has already set the flag
            if parent.0.cancellation_requested.load(Ordering::Acquire) {
                self.0.cancellation_requested.store(true, Ordering::Release);
            }
            drop(siblings);

            *parent_slot = Some(parent.clone());
        }

        self.0.bound.store(true, Ordering::Release);
    }
}

impl Default for TaskGroupContext {
    fn default() -> Self {
        Self::bound()
    }
}

impl fmt::Debug for TaskGroupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroupContext")
            .field("addr", &Arc::as_ptr(&self.0))
            .field("kind", &self.0.kind)
            .field("cancelled", &self.was_cancelled())
            .finish_non_exhaustive()
    }
}

fn propagate_cancellation(ctx: &ContextInner) {
    let children = ctx.children.lock();
    for child in children.iter() {
        if !child.cancellation_requested.swap(true, Ordering::AcqRel) {
            propagate_cancellation(child);
        }
    }
}

// === impl ContextInner ===

impl Drop for ContextInner {
    fn drop(&mut self) {
        debug_assert!(
            self.children.get_mut().is_empty(),
            "context dropped while bound children remain"
        );

        if let Some(parent) = self.parent.get_mut().take() {
            let mut siblings = parent.0.children.lock();
            // Safety: we were pushed onto our parent's list in `bind_to` and only
            // leave it here, while holding the same lock.
            let removed = unsafe { siblings.remove(NonNull::from(&*self)) };
            debug_assert!(removed.is_some());
        }
    }
}

// Safety: a bound context stays at a stable heap address (inside its `Arc`) and
// unlinks itself from its parent before that memory is released.
unsafe impl Linked<list::Links<Self>> for ContextInner {
    type Handle = NonNull<Self>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: ensured by caller
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}
