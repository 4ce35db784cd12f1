// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-script-thread working directory.
//!
//! Each script thread has its own logical cwd (its own `$PWD`); the process
//! has only one. This observer keeps a saved [`DirHandle`] per thread via the
//! [`PerThreadVar`] mechanism and, on every dispatch, points the process cwd
//! at the incoming thread's directory through the serializer so the cache
//! stays coherent.

use std::sync::Arc;

use super::{ChdirSerializer, CwdError, DirHandle};
use crate::sched::{PerThreadVar, ScriptThreadId, SchedulerObserver};

/// Scheduler observer that saves and restores the working directory across
/// context switches.
#[derive(Debug)]
pub struct CwdObserver {
    var: PerThreadVar<Arc<DirHandle>>,
    serializer: Arc<ChdirSerializer>,
}

impl CwdObserver {
    /// Create the observer with the process's current directory as the
    /// initial value every thread inherits.
    ///
    /// # Errors
    ///
    /// Fails if the current directory cannot be resolved or opened.
    pub fn new(serializer: Arc<ChdirSerializer>) -> Result<Self, CwdError> {
        let initial = std::env::current_dir().map_err(|source| CwdError::Open {
            path: ".".into(),
            source,
        })?;
        let handle = Arc::new(DirHandle::open(initial)?);
        Ok(Self {
            var: PerThreadVar::new("cwd", handle),
            serializer,
        })
    }

    /// The scheduled thread's directory handle.
    #[must_use]
    pub fn current(&self) -> Arc<DirHandle> { self.var.get() }

    /// Replace the scheduled thread's directory handle. The caller is
    /// responsible for having already pointed the process cwd at it (`cd`
    /// does this by holding a [`ChdirGuard`] while it swaps).
    ///
    /// [`ChdirGuard`]: super::ChdirGuard
    pub fn set_current(&self, dir: Arc<DirHandle>) { self.var.set(dir); }
}

impl SchedulerObserver for CwdObserver {
    fn did_spawn(&self, tid: ScriptThreadId) { self.var.did_spawn(tid); }

    fn will_unschedule(&self, tid: ScriptThreadId) { self.var.will_unschedule(tid); }

    fn did_schedule(&self, tid: ScriptThreadId) {
        self.var.did_schedule(tid);
        self.serializer.apply_for_dispatch(&self.var.get());
    }

    fn will_destroy(&self, tid: ScriptThreadId) { self.var.will_destroy(tid); }
}
