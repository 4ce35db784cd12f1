// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Background drain of a pipe into a [`SeparatedBuffer`].
//!
//! The reader is a preemptive OS thread, not a script thread: it never
//! touches interpreter state, never takes the interpreter lock, and only
//! appends to the buffer under the buffer's own mutex. Script threads that
//! want the result release the interpreter lock and block on the completion
//! latch.

use std::{os::fd::{AsFd, OwnedFd},
          sync::{Arc, Mutex, MutexGuard}};

use nix::{errno::Errno,
          poll::{PollFd, PollFlags, PollTimeout, poll},
          unistd};

use super::{SeparatedBuffer, SeparationKind};
use crate::common::Latch;

/// Read chunk size for draining the pipe.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Why a fill finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The write side of the pipe closed.
    Eof,
    /// [`BufferFill::shutdown`] was called (or the handle was dropped).
    Shutdown,
    /// A read error other than interruption.
    ReadError(Errno),
}

/// Errors from starting a fill.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BufferFillError {
    /// The internal shutdown pipe could not be created.
    #[error("could not create shutdown pipe: {errno}")]
    #[diagnostic(code(fish_exec::buffer::shutdown_pipe))]
    ShutdownPipe {
        /// The raw errno from `pipe2`.
        errno: Errno,
    },

    /// [`std::thread::Builder::spawn`] failed.
    #[error("failed to spawn buffer-fill reader thread")]
    #[diagnostic(
        code(fish_exec::buffer::thread_spawn),
        help(
            "the system may have reached its thread limit - \
             check `ulimit -u` for the per-user limit"
        )
    )]
    ThreadSpawn(#[source] std::io::Error),
}

/// A running (or finished) background fill.
///
/// Once the completion latch is observed, no further mutation of the buffer
/// occurs; only then may element order be inspected.
#[derive(Debug)]
pub struct BufferFill {
    buffer: Arc<Mutex<SeparatedBuffer>>,
    done: Arc<Latch<FillOutcome>>,
    /// Write end of the self-pipe the reader polls alongside the data fd.
    /// Dropping it hangs up the read end, which the reader treats as
    /// shutdown.
    shutdown_tx: OwnedFd,
}

impl BufferFill {
    /// Take ownership of the read end of a pipe and start draining it into a
    /// buffer bounded by `limit` (`0` for unlimited).
    ///
    /// # Errors
    ///
    /// See [`BufferFillError`].
    pub fn start(fd: OwnedFd, limit: usize) -> Result<Self, BufferFillError> {
        let (shutdown_rx, shutdown_tx) =
            unistd::pipe().map_err(|errno| BufferFillError::ShutdownPipe { errno })?;

        let buffer = Arc::new(Mutex::new(SeparatedBuffer::new(limit)));
        let done = Arc::new(Latch::new());

        let thread_buffer = Arc::clone(&buffer);
        let thread_done = Arc::clone(&done);
        std::thread::Builder::new()
            .name("buffer-fill".into())
            .spawn(move || {
                let outcome = drain_pipe(&fd, &shutdown_rx, &thread_buffer);
                tracing::debug!("buffer-fill finished: {outcome:?}");
                thread_done.set(outcome);
            })
            .map_err(BufferFillError::ThreadSpawn)?;

        Ok(Self {
            buffer,
            done,
            shutdown_tx,
        })
    }

    /// Ask the reader to stop even though the pipe is still open. Idempotent.
    pub fn shutdown(&self) {
        // A failed write means the reader is already gone; nothing to do.
        let _unused = unistd::write(self.shutdown_tx.as_fd(), b"x");
    }

    /// Block until the fill reaches a terminal state.
    pub fn wait_until_done(&self) -> FillOutcome { self.done.wait() }

    /// Non-blocking check for completion.
    #[must_use]
    pub fn try_outcome(&self) -> Option<FillOutcome> { self.done.try_get() }

    /// Access the buffer. Until [`wait_until_done`] has returned, contents
    /// are a moving target.
    ///
    /// [`wait_until_done`]: Self::wait_until_done
    pub fn buffer(&self) -> MutexGuard<'_, SeparatedBuffer> {
        self.buffer.lock().expect("buffer-fill buffer poisoned")
    }
}

/// The reader loop: poll both fds, drain data, stop on EOF / shutdown /
/// error. Overflow is not terminal for the loop — the pipe keeps getting
/// drained, the buffer just discards (and reports so through its flag).
fn drain_pipe(
    fd: &OwnedFd,
    shutdown_rx: &OwnedFd,
    buffer: &Mutex<SeparatedBuffer>,
) -> FillOutcome {
    let mut chunk = [0_u8; READ_CHUNK_SIZE];
    let mut overflow_logged = false;
    loop {
        let mut poll_fds = [
            PollFd::new(fd.as_fd(), PollFlags::POLLIN),
            PollFd::new(shutdown_rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return FillOutcome::ReadError(errno),
        }

        let shutdown_requested = poll_fds[1].revents().is_some_and(|revents| {
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
        });
        if shutdown_requested {
            return FillOutcome::Shutdown;
        }

        match unistd::read(fd.as_fd(), &mut chunk) {
            Ok(0) => return FillOutcome::Eof,
            Ok(count) => {
                let mut buffer = buffer.lock().expect("buffer-fill buffer poisoned");
                let appended = buffer.append(&chunk[..count], SeparationKind::Inferred);
                if !appended && !overflow_logged {
                    overflow_logged = true;
                    tracing::warn!(
                        "buffer-fill overflowed its limit; draining and discarding"
                    );
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return FillOutcome::ReadError(errno),
        }
    }
}
