// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! Subscriber lists are guarded by `std::sync::RwLock` because they are
//! touched from `Drop` of a subscription handle, where no async lock can be
//! awaited. A subscriber callback that panics while a notification holds the
//! read guard must not take the whole registry down with it, so a poisoned
//! lock is logged and the guard recovered.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "torstream::locks",
                "LOCK_POISONED_READ | a thread panicked while holding this lock, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "torstream::locks",
                "LOCK_POISONED_WRITE | a thread panicked while holding this lock, recovering"
            );
            poisoned.into_inner()
        }
    }
}
