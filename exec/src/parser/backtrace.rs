// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Backtrace frames carried by each parser.

use std::fmt::{Display, Formatter, Result};

/// What kind of construct pushed the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A function call.
    Function,
    /// A block construct (`begin`, `if`, `while`, ...).
    Block,
    /// An event handler invocation.
    Event,
}

/// One backtrace frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub kind: FrameKind,
    /// Function or block name as it should appear in a trace.
    pub name: String,
}

impl TraceFrame {
    #[must_use]
    pub fn new(kind: FrameKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self.kind {
            FrameKind::Function => write!(f, "in function '{}'", self.name),
            FrameKind::Block => write!(f, "in block '{}'", self.name),
            FrameKind::Event => write!(f, "in event handler '{}'", self.name),
        }
    }
}
