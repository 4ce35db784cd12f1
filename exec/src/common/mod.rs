// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Connect to source file.
pub mod latch;

// Re-export.
pub use latch::*;
