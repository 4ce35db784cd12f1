// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Connect to source file.
pub mod dir_handle;
pub mod observer;
pub mod serializer;

// Re-export.
pub use dir_handle::*;
pub use observer::*;
pub use serializer::*;
