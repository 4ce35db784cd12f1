// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Branching: spawning a child parser on its own script thread.
//!
//! This is the mechanism behind subshells, backgrounded functions, and
//! parallel pipeline stages. The child shares globals by reference, sees the
//! parent's locals as a read-only seed, inherits the parent's cwd, and starts
//! with `$status` 0. When its body returns, its parser is torn down (closing
//! any descriptors it adopted), its script thread is deregistered, and its
//! exit status is published on a latch for `wait`.

use std::sync::Arc;

use crate::{common::Latch,
            parser::Parser,
            sched::ScriptThreadId,
            status::{STATUS_WAIT_INTERRUPTED, Statuses}};

use super::Executor;

/// The body of a branched script thread. Runs with the interpreter lock
/// held; must use the executor's suspension helpers around anything that
/// blocks.
pub type BranchBody = Box<dyn FnOnce(&mut Parser, &Arc<Executor>) -> i32 + Send + 'static>;

/// Errors from [`Executor::branch`].
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BranchError {
    /// Branching requires the `concurrent` feature flag.
    #[error("cannot branch: the 'concurrent' feature flag is off")]
    #[diagnostic(
        code(fish_exec::branch::concurrent_disabled),
        help("enable it with the 'concurrent' feature flag")
    )]
    ConcurrentDisabled,

    /// [`std::thread::Builder::spawn`] failed.
    #[error("failed to spawn a script thread")]
    #[diagnostic(
        code(fish_exec::branch::thread_spawn),
        help(
            "the system may have reached its thread limit - \
             check `ulimit -u` for the per-user limit"
        )
    )]
    ThreadSpawn(#[source] std::io::Error),
}

/// Handle to a branched script thread, used to `wait` on it.
#[derive(Debug)]
pub struct BranchHandle {
    tid: ScriptThreadId,
    desc: String,
    pub(super) done: Arc<Latch<i32>>,
}

impl BranchHandle {
    /// The child's script thread id.
    #[must_use]
    pub fn tid(&self) -> ScriptThreadId { self.tid }

    /// Human-readable description of what the child runs.
    #[must_use]
    pub fn desc(&self) -> &str { &self.desc }

    /// The child's exit status, if it already finished.
    #[must_use]
    pub fn try_status(&self) -> Option<i32> { self.done.try_get() }

    /// Has the child's script body returned?
    #[must_use]
    pub fn is_finished(&self) -> bool { self.done.is_set() }
}

impl Executor {
    /// Branch `parent` into a child parser running `body` on a new script
    /// thread.
    ///
    /// Must be called while `parent`'s thread is scheduled: the new thread's
    /// initial per-thread state is snapshotted from the live (parent) state,
    /// after which its `$status` is reset to zero.
    ///
    /// # Errors
    ///
    /// See [`BranchError`].
    pub fn branch(
        self: &Arc<Self>,
        parent: &Parser,
        desc: impl Into<String>,
        body: impl FnOnce(&mut Parser, &Arc<Executor>) -> i32 + Send + 'static,
    ) -> Result<BranchHandle, BranchError> {
        if !self.features().test(crate::flags::FeatureFlag::Concurrent) {
            return Err(BranchError::ConcurrentDisabled);
        }
        debug_assert!(
            self.gil().is_scheduled(parent.tid()),
            "branch requires the parent to be scheduled"
        );

        let desc = desc.into();
        let tid = self.gil().spawn();
        // The spawn snapshot gave the child the parent's statuses; a child
        // starts fresh.
        self.statuses_var().put(tid, Statuses::default());

        let mut child = Parser::branch_from(parent, tid);
        let done = Arc::new(Latch::new());

        let executor = Arc::clone(self);
        let thread_done = Arc::clone(&done);
        let thread_desc = desc.clone();
        let spawned = std::thread::Builder::new()
            .name(tid.to_string())
            .spawn(move || {
                executor.gil().run(tid);
                tracing::debug!("{tid} started: {thread_desc}");
                let status = body(&mut child, &executor);
                // Tear the parser down while still scheduled so descriptor
                // closes happen before the next thread runs.
                drop(child);
                executor.gil().release(tid);
                executor.gil().destroy(tid);
                thread_done.set(status);
            });
        if let Err(error) = spawned {
            // Roll back the registration; the child never ran.
            self.gil().destroy(tid);
            return Err(BranchError::ThreadSpawn(error));
        }

        Ok(BranchHandle { tid, desc, done })
    }

    /// Block (with the interpreter lock released) until the branched child
    /// finishes, then adopt its exit status as `$status`.
    ///
    /// Interruption by SIGINT abandons the wait: `$status` becomes
    /// [`STATUS_WAIT_INTERRUPTED`], the child keeps running, and the
    /// cancellation flag is consumed.
    pub fn wait_branch(&self, waiter: &Parser, handle: &BranchHandle) -> i32 {
        let signals = self.signals();
        let outcome = self.unlocked(waiter.tid(), || {
            handle.done.wait_interruptible(|| signals.cancel_requested())
        });
        let status = match outcome {
            Some(status) => status,
            None => {
                signals.clear();
                STATUS_WAIT_INTERRUPTED
            }
        };
        self.set_status(status);
        status
    }
}
