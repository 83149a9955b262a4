// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::thread;

        #[cfg(test)]
        pub(crate) use loom::{model, lazy_static, sync, MAX_THREADS};
    } else {
        #[cfg(any(test, feature = "std"))]
        pub(crate) use std::thread;

        #[cfg(test)]
        pub(crate) use lazy_static::lazy_static;

        #[cfg(test)]
        pub(crate) const MAX_THREADS: usize = 5;

        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<F>(f: F)
        where
            F: Fn() + Sync + Send + 'static,
        {
            f()
        }

        #[cfg(test)]
        pub(crate) use std::sync;
    }
}
