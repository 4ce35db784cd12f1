// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Scheduler lifecycle hooks.
//!
//! Observers are how per-thread shell state (cwd, `$status`, local variable
//! stacks) gets swapped in and out around every context switch without the
//! accessors knowing anything about scheduling. The scheduler fires the four
//! hooks at well-defined points; see each method for the exact timing.

use std::fmt::{Display, Formatter, Result};

/// Identity of one script thread.
///
/// Monotonically assigned, never reused within a process. This is not an OS
/// thread id: several script threads may take turns on the same kernel
/// thread, and a script thread's work can migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptThreadId(pub u64);

impl Display for ScriptThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "script-thread-{}", self.0)
    }
}

/// Hooks fired by the scheduler on script thread lifecycle events.
///
/// All hooks run while the interpreter lock is logically held, so they may
/// touch shared state freely. They must be infallible: a hook that cannot do
/// its job (for example, a missing per-thread slot) indicates a lifecycle bug
/// and should panic rather than limp on with state from the wrong thread.
///
/// Ordering guarantee: for a switch from thread A to thread B,
/// [`will_unschedule`]`(A)` completes before [`did_schedule`]`(B)` begins.
/// [`did_spawn`] and [`will_destroy`] fire exactly once per thread.
///
/// [`will_unschedule`]: Self::will_unschedule
/// [`did_schedule`]: Self::did_schedule
/// [`did_spawn`]: Self::did_spawn
/// [`will_destroy`]: Self::will_destroy
pub trait SchedulerObserver: Send + Sync {
    /// A new script thread was registered. Fired before the thread is ever
    /// scheduled, from the context of the (scheduled) spawner, so "current
    /// live state" means the spawner's state.
    fn did_spawn(&self, tid: ScriptThreadId);

    /// The given thread is about to give up the interpreter lock. Its live
    /// state is still published; save it now.
    fn will_unschedule(&self, tid: ScriptThreadId);

    /// The given thread has just acquired the interpreter lock. Publish its
    /// saved state as the live state.
    fn did_schedule(&self, tid: ScriptThreadId);

    /// The given thread is being deregistered. It is neither scheduled nor
    /// queued; drop its saved state.
    fn will_destroy(&self, tid: ScriptThreadId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_thread_id_display() {
        assert_eq!(ScriptThreadId(3).to_string(), "script-thread-3");
    }
}
