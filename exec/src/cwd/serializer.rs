// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Fair serializer for the process-wide working directory.
//!
//! There is exactly one working directory per process, and it must be
//! correct across `fork`/`exec` — there is no `fork_at`. Script threads that
//! each logically live in a different directory take turns: a ticket lock
//! hands out turns FIFO, and callers that agree on the target directory share
//! a single hold instead of queueing behind each other.
//!
//! Holding a [`ChdirGuard`] pins the process cwd: it is guaranteed not to
//! change until the last agreeing guard drops. This is what makes
//! `fork()`-with-correct-cwd possible.

use std::sync::{Arc, Condvar, Mutex};

use super::{CwdError, DirHandle};

/// Ticket-lock state. `now_serving` never decreases and never exceeds
/// `next_ticket`; while `lock_count > 0` the cached `current` directory may
/// not change.
#[derive(Debug, Default)]
struct SerializerState {
    next_ticket: u64,
    now_serving: u64,
    /// The directory the process cwd currently points at, if known.
    current: Option<Arc<DirHandle>>,
    /// Number of live guards agreeing on `current`.
    lock_count: u32,
}

/// The fair `fchdir` serializer. One per process.
#[derive(Debug, Default)]
pub struct ChdirSerializer {
    state: Mutex<SerializerState>,
    turn: Condvar,
}

/// A hold on the process working directory. Dropping it releases the hold
/// and, when it was the last one, hands the turn to the next ticket.
#[derive(Debug)]
pub struct ChdirGuard<'a> {
    serializer: &'a ChdirSerializer,
}

impl Drop for ChdirGuard<'_> {
    fn drop(&mut self) { self.serializer.release(); }
}

impl ChdirSerializer {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Make `dir` the process working directory and pin it until the
    /// returned guard drops.
    ///
    /// Fast path: when nobody is waiting and the process is already in
    /// `dir`, join the current hold. Slow path: take a ticket, wait for the
    /// turn, `fchdir`.
    ///
    /// # Errors
    ///
    /// Any errno from `fchdir` is surfaced; the turn still advances so the
    /// next waiter is not stuck behind the failure.
    pub fn acquire(&self, dir: &Arc<DirHandle>) -> Result<ChdirGuard<'_>, CwdError> {
        let mut state = self.lock_state();

        // Fast path: no waiters and the cwd already agrees.
        let agrees = state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, dir));
        if agrees && state.now_serving == state.next_ticket {
            state.lock_count += 1;
            return Ok(ChdirGuard { serializer: self });
        }

        // Slow path: ticketed turn.
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        while state.now_serving + 1 != ticket || state.lock_count > 0 {
            state = self.turn.wait(state).expect("chdir serializer poisoned");
        }
        state.now_serving = ticket;

        let already_there = state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, dir));
        if !already_there {
            if let Err(error) = dir.apply() {
                // The cwd is unchanged; give the next waiter its turn.
                if state.now_serving < state.next_ticket {
                    self.turn.notify_all();
                }
                return Err(error);
            }
            state.current = Some(Arc::clone(dir));
        }
        state.lock_count = 1;
        Ok(ChdirGuard { serializer: self })
    }

    /// Restore the working directory during a context switch.
    ///
    /// Dispatch happens while the incoming thread holds the interpreter
    /// lock, and guards are only held by threads that keep the interpreter
    /// lock across their pinned section, so no hold can be live here. Errors
    /// are logged and swallowed: the switch must complete regardless, and the
    /// thread will get a hard error the moment it actually needs the cwd.
    pub fn apply_for_dispatch(&self, dir: &Arc<DirHandle>) {
        let mut state = self.lock_state();
        debug_assert_eq!(state.lock_count, 0, "cwd pinned across a context switch");
        match dir.apply() {
            Ok(()) => state.current = Some(Arc::clone(dir)),
            Err(error) => {
                state.current = None;
                tracing::warn!("could not restore working directory on dispatch: {error}");
            }
        }
    }

    /// Snapshot of `(now_serving, next_ticket)`.
    #[must_use]
    pub fn tickets(&self) -> (u64, u64) {
        let state = self.lock_state();
        (state.now_serving, state.next_ticket)
    }

    fn release(&self) {
        let mut state = self.lock_state();
        assert!(state.lock_count > 0, "chdir guard released twice");
        state.lock_count -= 1;
        if state.lock_count == 0 && state.now_serving < state.next_ticket {
            self.turn.notify_all();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SerializerState> {
        self.state.lock().expect("chdir serializer poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serial_test::serial;

    use super::*;

    fn handle_for(dir: &tempfile::TempDir) -> Arc<DirHandle> {
        Arc::new(DirHandle::open(dir.path()).unwrap())
    }

    #[test]
    #[serial]
    fn test_acquire_changes_process_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().canonicalize().unwrap();
        let serializer = ChdirSerializer::new();
        let handle = handle_for(&dir);

        let guard = serializer.acquire(&handle).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), target);
        drop(guard);
    }

    #[test]
    #[serial]
    fn test_agreeing_holders_share_without_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = ChdirSerializer::new();
        let handle = handle_for(&dir);

        let first = serializer.acquire(&handle).unwrap();
        let second = serializer.acquire(&handle).unwrap();
        // The second acquire joined the first hold: one ticket was consumed
        // in total.
        assert_eq!(serializer.tickets(), (1, 1));
        drop(second);
        drop(first);
    }

    #[test]
    #[serial]
    fn test_tickets_are_fifo_and_monotone() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let serializer = Arc::new(ChdirSerializer::new());
        let handle_a = handle_for(&dir_a);
        let handle_b = handle_for(&dir_b);

        let guard = serializer.acquire(&handle_a).unwrap();

        let contender = {
            let serializer = Arc::clone(&serializer);
            let handle_b = Arc::clone(&handle_b);
            thread::spawn(move || {
                let guard = serializer.acquire(&handle_b).unwrap();
                let (now_serving, next_ticket) = serializer.tickets();
                assert!(now_serving <= next_ticket);
                drop(guard);
            })
        };

        // Wait until the contender has taken its ticket, then release.
        while serializer.tickets().1 < 2 {
            thread::yield_now();
        }
        let (now_serving, next_ticket) = serializer.tickets();
        assert!(now_serving < next_ticket);
        drop(guard);
        contender.join().unwrap();

        let (now_serving, next_ticket) = serializer.tickets();
        assert_eq!(now_serving, next_ticket);
    }

    #[test]
    #[serial]
    fn test_dispatch_restore_updates_cache() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let serializer = ChdirSerializer::new();
        let handle_a = handle_for(&dir_a);
        let handle_b = handle_for(&dir_b);

        serializer.apply_for_dispatch(&handle_a);
        assert_eq!(
            std::env::current_dir().unwrap(),
            dir_a.path().canonicalize().unwrap()
        );

        serializer.apply_for_dispatch(&handle_b);
        // The cache followed the dispatch, so re-acquiring B is a fast path.
        let guard = serializer.acquire(&handle_b).unwrap();
        assert_eq!(serializer.tickets(), (0, 0));
        drop(guard);
    }
}
