// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Job id allocation.
//!
//! Job ids are what `jobs` prints and what `%N` refers to. Allocation picks
//! the smallest value greater than any id currently in use, so ids keep
//! climbing while any job is alive and reset to 1 once the job table empties.
//! The id is released when its [`JobId`] handle drops.

use std::{collections::BTreeSet,
          fmt::{Display, Formatter, Result},
          sync::Mutex};

/// Ids currently in use, process-wide (the job table is a process-wide
/// resource even with many script threads).
static LIVE_JOB_IDS: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

/// An allocated job id. Dropping it returns the id to the pool.
#[derive(Debug, PartialEq, Eq)]
pub struct JobId(u64);

impl JobId {
    /// Allocate the smallest id greater than any currently in use.
    #[must_use]
    pub fn acquire() -> Self {
        let mut live = LIVE_JOB_IDS.lock().expect("job id table poisoned");
        let id = live.last().map_or(1, |max| max + 1);
        live.insert(id);
        Self(id)
    }

    /// The numeric id.
    #[must_use]
    pub fn get(&self) -> u64 { self.0 }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result { write!(f, "{}", self.0) }
}

impl Drop for JobId {
    fn drop(&mut self) {
        let mut live = LIVE_JOB_IDS.lock().expect("job id table poisoned");
        live.remove(&self.0);
    }
}
