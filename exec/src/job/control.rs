// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Job-control mode, settable at runtime via `status job-control`.

use strum_macros::{Display, EnumString};

/// When jobs get their own process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum JobControlMode {
    /// Every job gets its own pgid, forking a pgid owner when necessary.
    Full,
    /// Jobs get their own pgid only when the shell is interactive.
    #[default]
    Interactive,
    /// Jobs stay in the shell's own process group.
    None,
}

impl JobControlMode {
    /// Should a job launched now want its own process group?
    #[must_use]
    pub fn wants_job_control(self, shell_is_interactive: bool) -> bool {
        match self {
            JobControlMode::Full => true,
            JobControlMode::Interactive => shell_is_interactive,
            JobControlMode::None => false,
        }
    }
}
