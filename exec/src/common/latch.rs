// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! One-shot completion latch built on [`Mutex`] + [`Condvar`].
//!
//! Used wherever one thread produces a final value exactly once and any
//! number of threads block until it is available: script thread exit
//! statuses, background pipe drains reaching EOF.

use std::{sync::{Condvar, Mutex},
          time::Duration};

/// Granularity at which [`Latch::wait_interruptible`] re-checks its
/// interrupt predicate while blocked.
const INTERRUPT_POLL: Duration = Duration::from_millis(20);

/// A write-once cell that other threads can block on.
///
/// [`set`] may be called exactly once; a second call panics, since a double
/// completion indicates a lifecycle bug in the caller.
///
/// [`set`]: Self::set
#[derive(Debug, Default)]
pub struct Latch<T: Clone> {
    value: Mutex<Option<T>>,
    signal: Condvar,
}

impl<T: Clone> Latch<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    /// Publish the value and wake all waiters.
    ///
    /// # Panics
    ///
    /// Panics if the latch was already set.
    pub fn set(&self, value: T) {
        let mut guard = self.value.lock().expect("latch mutex poisoned");
        assert!(guard.is_none(), "latch set twice");
        *guard = Some(value);
        self.signal.notify_all();
    }

    /// Non-blocking read of the value, if already published.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.value.lock().expect("latch mutex poisoned").clone()
    }

    /// Has the value been published?
    #[must_use]
    pub fn is_set(&self) -> bool { self.try_get().is_some() }

    /// Block until the value is published.
    #[must_use]
    pub fn wait(&self) -> T {
        let mut guard = self.value.lock().expect("latch mutex poisoned");
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = self.signal.wait(guard).expect("latch mutex poisoned");
        }
    }

    /// Block until the value is published or `interrupted` reports true.
    ///
    /// Returns [`None`] when interrupted first. The predicate is polled at a
    /// coarse interval rather than hooked into signal delivery, which is
    /// plenty for a flag that is observed at cooperative suspension points.
    #[must_use]
    pub fn wait_interruptible(&self, interrupted: impl Fn() -> bool) -> Option<T> {
        let mut guard = self.value.lock().expect("latch mutex poisoned");
        loop {
            if let Some(value) = guard.as_ref() {
                return Some(value.clone());
            }
            if interrupted() {
                return None;
            }
            let (next, _timeout) = self
                .signal
                .wait_timeout(guard, INTERRUPT_POLL)
                .expect("latch mutex poisoned");
            guard = next;
        }
    }
}
