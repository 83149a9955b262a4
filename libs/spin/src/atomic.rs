// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Atomic words with explicitly tagged operations.
//!
//! This is a thin layer over [`core::sync::atomic`] that exposes the operation set the
//! scheduler is written against. The important difference to the core API is
//! [`Atomic::compare_and_swap`], which always hands back the value that was observed,
//! whether or not the exchange happened. Callers compare that value against their
//! comparand to find out if they won a race.
//!
//! Every operation takes an [`Ordering`]. Read-modify-write operations accept
//! `Relaxed`, `Acquire`, `Release`, `AcqRel` and `SeqCst` (the latter being a full
//! fence). Alignment of the underlying storage is guaranteed by the core atomic types.

use core::fmt;
pub use core::sync::atomic::Ordering;

use core::sync::atomic;

mod sealed {
    pub trait Sealed {}
}

/// Primitive integers that have a native atomic counterpart.
pub trait AtomicPrimitive: sealed::Sealed + Copy + Eq {
    #[doc(hidden)]
    type Cell: Send + Sync;

    #[doc(hidden)]
    fn load(cell: &Self::Cell, order: Ordering) -> Self;
    #[doc(hidden)]
    fn store(cell: &Self::Cell, value: Self, order: Ordering);
    #[doc(hidden)]
    fn compare_exchange(
        cell: &Self::Cell,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;
    #[doc(hidden)]
    fn swap(cell: &Self::Cell, value: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn fetch_add(cell: &Self::Cell, value: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn fetch_sub(cell: &Self::Cell, value: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn fetch_or(cell: &Self::Cell, value: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn fetch_and(cell: &Self::Cell, value: Self, order: Ordering) -> Self;
}

/// An integer that can be safely shared between threads.
#[repr(transparent)]
pub struct Atomic<T: AtomicPrimitive> {
    cell: T::Cell,
}

// === impl Atomic ===

impl<T: AtomicPrimitive> Atomic<T> {
    /// Loads the current value.
    #[inline]
    pub fn load(&self, order: Ordering) -> T {
        T::load(&self.cell, order)
    }

    /// Stores `value`.
    #[inline]
    pub fn store(&self, value: T, order: Ordering) {
        T::store(&self.cell, value, order);
    }

    /// Stores `new` if the current value equals `comparand`.
    ///
    /// Returns the value observed *before* the operation, regardless of whether the
    /// store took place. The exchange succeeded iff the returned value equals
    /// `comparand`.
    #[inline]
    pub fn compare_and_swap(&self, new: T, comparand: T, order: Ordering) -> T {
        match T::compare_exchange(&self.cell, comparand, new, order, failure_ordering(order)) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Adds `addend` (wrapping on overflow) and returns the previous value.
    #[inline]
    pub fn fetch_and_add(&self, addend: T, order: Ordering) -> T {
        T::fetch_add(&self.cell, addend, order)
    }

    /// Subtracts `subtrahend` (wrapping on overflow) and returns the previous value.
    #[inline]
    pub fn fetch_and_sub(&self, subtrahend: T, order: Ordering) -> T {
        T::fetch_sub(&self.cell, subtrahend, order)
    }

    /// Replaces the current value with `value` and returns the previous value.
    #[inline]
    pub fn fetch_and_store(&self, value: T, order: Ordering) -> T {
        T::swap(&self.cell, value, order)
    }

    /// Bitwise-or with `bits`, returning the previous value.
    #[inline]
    pub fn fetch_and_or(&self, bits: T, order: Ordering) -> T {
        T::fetch_or(&self.cell, bits, order)
    }

    /// Bitwise-and with `bits`, returning the previous value.
    #[inline]
    pub fn fetch_and_and(&self, bits: T, order: Ordering) -> T {
        T::fetch_and(&self.cell, bits, order)
    }
}

impl<T: AtomicPrimitive + fmt::Debug> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

/// The strongest ordering a failed compare-exchange may use for a given success ordering.
const fn failure_ordering(order: Ordering) -> Ordering {
    match order {
        Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Acquire,
    }
}

macro_rules! atomic_primitive {
    ($($prim:ty => $cell:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $prim {}

            impl AtomicPrimitive for $prim {
                type Cell = atomic::$cell;

                #[inline(always)]
                fn load(cell: &Self::Cell, order: Ordering) -> Self {
                    cell.load(order)
                }
                #[inline(always)]
                fn store(cell: &Self::Cell, value: Self, order: Ordering) {
                    cell.store(value, order);
                }
                #[inline(always)]
                fn compare_exchange(
                    cell: &Self::Cell,
                    current: Self,
                    new: Self,
                    success: Ordering,
                    failure: Ordering,
                ) -> Result<Self, Self> {
                    cell.compare_exchange(current, new, success, failure)
                }
                #[inline(always)]
                fn swap(cell: &Self::Cell, value: Self, order: Ordering) -> Self {
                    cell.swap(value, order)
                }
                #[inline(always)]
                fn fetch_add(cell: &Self::Cell, value: Self, order: Ordering) -> Self {
                    cell.fetch_add(value, order)
                }
                #[inline(always)]
                fn fetch_sub(cell: &Self::Cell, value: Self, order: Ordering) -> Self {
                    cell.fetch_sub(value, order)
                }
                #[inline(always)]
                fn fetch_or(cell: &Self::Cell, value: Self, order: Ordering) -> Self {
                    cell.fetch_or(value, order)
                }
                #[inline(always)]
                fn fetch_and(cell: &Self::Cell, value: Self, order: Ordering) -> Self {
                    cell.fetch_and(value, order)
                }
            }

            impl Atomic<$prim> {
                #[must_use]
                pub const fn new(value: $prim) -> Self {
                    Self {
                        cell: atomic::$cell::new(value),
                    }
                }
            }

            impl Default for Atomic<$prim> {
                fn default() -> Self {
                    Self::new(0)
                }
            }
        )*
    };
}

atomic_primitive! {
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
    i32 => AtomicI32,
    i64 => AtomicI64,
    isize => AtomicIsize,
}
