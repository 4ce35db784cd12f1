// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Exit status conventions and the `$status` / `$pipestatus` value type.
//!
//! The numeric constants follow the usual shell conventions: `126` for a
//! command that was found but could not be executed, `127` for a command that
//! was not found, and `128 + N` for death by signal `N`.

use smallvec::{SmallVec, smallvec};

/// Command completed successfully.
pub const STATUS_CMD_OK: i32 = 0;

/// Command completed but reported failure.
pub const STATUS_CMD_ERROR: i32 = 1;

/// A `wait` was interrupted by SIGINT before the awaited job finished.
pub const STATUS_WAIT_INTERRUPTED: i32 = 124;

/// Reserved. Test harnesses use this value to report a skipped case; the
/// shell never produces it on its own.
pub const STATUS_TEST_SKIPPED: i32 = 125;

/// The file exists but is not executable (exec was denied).
pub const STATUS_NOT_EXECUTABLE: i32 = 126;

/// The command could not be found.
pub const STATUS_CMD_UNKNOWN: i32 = 127;

/// Exit status reported for a process killed by signal `signal_number`.
#[must_use]
pub fn status_from_signal(signal_number: i32) -> i32 { 128 + signal_number }

/// Inline capacity for `$pipestatus`. Pipelines longer than this spill to the
/// heap.
pub type PipeStatusList = SmallVec<[i32; 8]>;

/// The `$status` / `$pipestatus` pair of one script thread.
///
/// Every script thread observes its own copy of this value; it is registered
/// with the scheduler as a per-thread variable so the live value is swapped on
/// every dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statuses {
    /// Last reported `$status`.
    pub status: i32,
    /// Per-stage statuses of the last pipeline, `$pipestatus`.
    pub pipestatus: PipeStatusList,
}

impl Statuses {
    /// Both `$status` and `$pipestatus` reflecting a single just-completed
    /// command.
    #[must_use]
    pub fn just(status: i32) -> Self {
        Self {
            status,
            pipestatus: smallvec![status],
        }
    }

    /// Statuses reflecting a completed pipeline. `$status` is the status of
    /// the last stage.
    #[must_use]
    pub fn from_pipeline(pipestatus: PipeStatusList) -> Self {
        let status = pipestatus.last().copied().unwrap_or(STATUS_CMD_OK);
        Self { status, pipestatus }
    }
}

impl Default for Statuses {
    fn default() -> Self { Self::just(STATUS_CMD_OK) }
}
