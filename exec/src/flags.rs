// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Runtime feature flags.
//!
//! Flags are process-wide booleans that gate behavior which is still being
//! rolled out. The only flag today is [`FeatureFlag::Concurrent`], which
//! enables multiple script threads. With it off the shell runs strictly
//! single-threaded: no branching, no pgid-owner forks for internal pipelines.

use std::sync::atomic::{AtomicBool, Ordering};

use strum_macros::{Display, EnumString};

/// Names of the known feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FeatureFlag {
    /// Allow script to run on multiple cooperatively scheduled script
    /// threads.
    Concurrent,
}

/// The process-wide flag store.
///
/// Reads are lock-free; writes are expected only during startup or from a
/// `set` style builtin while the writer holds the interpreter lock.
#[derive(Debug, Default)]
pub struct FeatureSet {
    concurrent: AtomicBool,
}

impl FeatureSet {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Is the given flag enabled?
    #[must_use]
    pub fn test(&self, flag: FeatureFlag) -> bool {
        match flag {
            FeatureFlag::Concurrent => self.concurrent.load(Ordering::SeqCst),
        }
    }

    /// Enable or disable a flag.
    pub fn set(&self, flag: FeatureFlag, value: bool) {
        match flag {
            FeatureFlag::Concurrent => {
                self.concurrent.store(value, Ordering::SeqCst);
            }
        }
        tracing::debug!("feature flag '{flag}' set to {value}");
    }
}
