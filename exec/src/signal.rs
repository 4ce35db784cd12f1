// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cancellation via SIGINT.
//!
//! Script threads are never interrupted preemptively. Delivery of SIGINT sets
//! a process-wide flag; long-running constructs observe the flag at their
//! next cooperative suspension point and unwind by returning a status, not by
//! unwinding the stack.

use std::{ffi::c_int,
          sync::atomic::{AtomicBool, Ordering}};

use nix::{errno::Errno,
          sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction}};

use crate::status::status_from_signal;

/// Process-wide "cancel requested" flag. Written from the signal handler, so
/// it must be an atomic with no locking anywhere near it.
static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_sigint(_signal_number: c_int) {
    CANCEL_REQUESTED.store(true, Ordering::SeqCst);
}

/// Read/clear access to the cancellation flag.
///
/// Cloning is free; every holder observes the same process-wide flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalChecker;

impl SignalChecker {
    #[must_use]
    pub fn new() -> Self { Self }

    /// Has SIGINT been delivered since the flag was last cleared?
    #[must_use]
    pub fn cancel_requested(&self) -> bool { CANCEL_REQUESTED.load(Ordering::SeqCst) }

    /// Clear the flag. Called once the interrupt has been consumed (for
    /// example after `wait` returns [`STATUS_WAIT_INTERRUPTED`]).
    ///
    /// [`STATUS_WAIT_INTERRUPTED`]: crate::status::STATUS_WAIT_INTERRUPTED
    pub fn clear(&self) { CANCEL_REQUESTED.store(false, Ordering::SeqCst) }

    /// Raise the flag without an actual signal delivery. Used by tests and by
    /// builtins that want to simulate an interrupt.
    pub fn request_cancel(&self) { CANCEL_REQUESTED.store(true, Ordering::SeqCst) }

    /// The `$status` value for a job killed by SIGINT.
    #[must_use]
    pub fn interrupt_status(&self) -> i32 { status_from_signal(Signal::SIGINT as i32) }
}

/// Install the SIGINT handler that raises the cancellation flag.
///
/// `SA_RESTART` is deliberately left off: blocking `waitpid`/`read` calls
/// must come back with `EINTR` so their callers get a chance to observe the
/// flag.
///
/// # Errors
///
/// Returns the raw [`Errno`] if the handler cannot be installed.
pub fn install_sigint_handler() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(note_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.map(|_previous| ())
}

/// Ignore SIGPIPE process-wide.
///
/// Pipeline plumbing writes into pipes whose readers may exit early; the
/// write must fail with `EPIPE`, not kill the shell.
///
/// # Errors
///
/// Returns the raw [`Errno`] if the disposition cannot be set.
pub fn ignore_sigpipe() -> Result<(), Errno> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &action) }.map(|_previous| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_and_clear() {
        let checker = SignalChecker::new();
        checker.clear();
        assert!(!checker.cancel_requested());
        checker.request_cancel();
        assert!(checker.cancel_requested());
        checker.clear();
        assert!(!checker.cancel_requested());
    }

    #[test]
    fn test_interrupt_status_is_130() {
        assert_eq!(SignalChecker::new().interrupt_status(), 130);
    }
}
