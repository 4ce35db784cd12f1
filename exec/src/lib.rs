// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words pgid pgids fchdir setpgid waitpid pipestatus subshell subshells

//! # Concurrent execution core
//!
//! This crate is the concurrency heart of the shell: it lets many "threads of
//! script" (functions, pipeline stages, backgrounded jobs, subshells) run
//! interleaved inside one process, while each observes its own `$PWD`,
//! `$status`, local variables, and backtrace. `fork()` is not an option for
//! function pipelines — a global set inside a pipeline must be visible to the
//! enclosing shell — so isolation comes from cooperative scheduling plus
//! per-thread state swapping, not from separate address spaces.
//!
//! ## The two tiers of threads
//!
//! - **Script threads** execute shell script. They are cooperatively
//!   scheduled by the interpreter lock ([`Gil`]): at most one runs at any
//!   instant, handoff is strict FIFO, and a thread keeps its turn until it
//!   yields or blocks. Before any blocking syscall it releases the lock and
//!   queues up again afterward.
//! - **I/O threads** are ordinary preemptive OS threads ([`BufferFill`], the
//!   pipe feeders). They never touch interpreter state and never take the
//!   interpreter lock.
//!
//! ## Per-thread state
//!
//! [`SchedulerObserver`]s fire on every spawn / dispatch / undispatch /
//! destroy. [`PerThreadVar`] rides those hooks to give each script thread its
//! own copy of a logically process-wide value; [`CwdObserver`] does the same
//! for the working directory, additionally pointing the real process cwd at
//! the scheduled thread's directory on each dispatch. The process cwd itself
//! is arbitrated by [`ChdirSerializer`], a fair ticket lock whose holders pin
//! the cwd across `fork`.
//!
//! ## Jobs and process groups
//!
//! [`JobGroup`] decides whether a launching job inherits its parent's group
//! or gets a fresh one, and [`Executor::run_pipeline`] places every stage —
//! script-thread stages and forked children alike — into one process group,
//! forking a throwaway pgid owner when no real child can lend the group a
//! pid. Signal delivery to a mixed pipeline is therefore still atomic.
//!
//! ## Entry points
//!
//! Create an [`Executor`], take the root [`Parser`] with [`Executor::root`],
//! then use [`Executor::branch`] (subshells, `&`),
//! [`Executor::run_pipeline`], [`Executor::cd`], and [`Executor::wait_job`].
//! The `concurrent` feature flag ([`FeatureFlag::Concurrent`]) gates
//! branching; with it off the executor runs pipelines single-threaded with
//! buffered plumbing.

// Attach.
pub mod buffer;
pub mod common;
pub mod cwd;
pub mod exec;
pub mod flags;
pub mod job;
pub mod log;
pub mod parser;
pub mod sched;
pub mod signal;
pub mod status;

// Re-export.
pub use buffer::*;
pub use common::*;
pub use cwd::*;
pub use exec::*;
pub use flags::*;
pub use job::*;
pub use parser::*;
pub use sched::*;
pub use signal::*;
pub use status::*;
