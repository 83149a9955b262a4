// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use std::borrow::Cow;
use std::io;
use std::panic;
use std::sync::Arc;

/// An error that escaped a task body and is carried to the thread waiting on the
/// task's group.
///
/// Exceptions come in two flavours:
///
/// - *captured* exceptions only remember the name of the original error type and its
///   message. Everything that converts via `From<E: Error>` or is recovered from a
///   panic ends up as a captured exception.
/// - *movable* exceptions additionally carry the original value, which waiters can
///   get back with [`Exception::downcast_ref`].
///
/// Cloning an `Exception` is cheap, all clones refer to the same payload.
#[derive(Clone)]
pub struct Exception(Arc<ExceptionInner>);

struct ExceptionInner {
    name: Cow<'static, str>,
    what: String,
    payload: Option<Box<dyn Any + Send + Sync>>,
}

// === impl Exception ===

impl Exception {
    /// Creates an exception that only records `name` and `what`.
    pub fn captured(name: impl Into<Cow<'static, str>>, what: impl Into<String>) -> Self {
        Self(Arc::new(ExceptionInner {
            name: name.into(),
            what: what.into(),
            payload: None,
        }))
    }

    /// Creates an exception that carries `payload` to the waiter.
    pub fn movable<T>(payload: T) -> Self
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        Self(Arc::new(ExceptionInner {
            name: Cow::Borrowed(core::any::type_name::<T>()),
            what: payload.to_string(),
            payload: Some(Box::new(payload)),
        }))
    }

    /// Turns a panic payload into an exception.
    ///
    /// Exceptions that were raised with [`Exception::throw`] are recovered as-is, string
    /// payloads become captured exceptions.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<Exception>() {
            Ok(exception) => *exception,
            Err(payload) => {
                let what = if let Some(s) = payload.downcast_ref::<&'static str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Box<dyn Any>".to_string()
                };
                Self::captured("panic", what)
            }
        }
    }

    /// The name of the error type this exception was created from.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The human readable description of the error.
    pub fn what(&self) -> &str {
        &self.0.what
    }

    /// Returns `true` if this exception carries its original value.
    pub fn is_movable(&self) -> bool {
        self.0.payload.is_some()
    }

    /// Returns the carried value if this is a movable exception of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.payload.as_ref()?.downcast_ref::<T>()
    }

    /// Raises this exception as a panic.
    ///
    /// The scheduler catches it at the task boundary and registers it with the task's
    /// group unchanged.
    pub fn throw(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> From<E> for Exception
where
    E: core::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::captured(core::any::type_name::<E>(), err.to_string())
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.name, self.0.what)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("name", &self.0.name)
            .field("what", &self.0.what)
            .field("movable", &self.is_movable())
            .finish()
    }
}

/// Errors returned by [`Builder::build`](crate::Builder::build).
#[derive(Debug)]
pub enum BuildError {
    /// A runtime needs at least one thread, the calling thread included.
    ZeroThreads,
    /// The operating system refused to spawn a worker thread.
    Spawn(io::Error),
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        Self::Spawn(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::ZeroThreads => f.write_str("number of threads must be at least 1"),
            BuildError::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl core::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            BuildError::ZeroThreads => None,
            BuildError::Spawn(err) => Some(err),
        }
    }
}

/// Errors returned when binding the calling thread to a scheduler.
#[derive(Debug)]
pub enum EnterError {
    /// The thread is already bound to a different runtime.
    BoundElsewhere,
    /// All master slots of the runtime are taken.
    NoFreeSlot,
    /// Creating the default runtime failed.
    Build(BuildError),
}

impl From<BuildError> for EnterError {
    fn from(err: BuildError) -> Self {
        Self::Build(err)
    }
}

impl fmt::Display for EnterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnterError::BoundElsewhere => {
                f.write_str("thread is already bound to a different runtime")
            }
            EnterError::NoFreeSlot => f.write_str("no free master slot in runtime"),
            EnterError::Build(err) => write!(f, "failed to build runtime: {err}"),
        }
    }
}

impl core::error::Error for EnterError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            EnterError::Build(err) => Some(err),
            _ => None,
        }
    }
}
