// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A bounded, separation-aware output buffer.
//!
//! Captured command output is a sequence of byte runs, each tagged with how
//! it was separated from its neighbor: [`Explicit`] runs came from
//! record-oriented input (null-separated `read`, `string split0`, ...) and
//! keep their boundary; [`Inferred`] runs are merely adjacent bytes and
//! coalesce with an adjacent inferred run on append.
//!
//! The buffer is bounded. Appending past the limit flips a sticky `discard`
//! flag, empties the buffer, and makes every further append a no-op until the
//! flag is reset — the producer keeps draining its pipe, the data just goes
//! nowhere, and the consuming builtin reports truncation.
//!
//! [`Explicit`]: SeparationKind::Explicit
//! [`Inferred`]: SeparationKind::Inferred

/// How an element is separated from the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationKind {
    /// Adjacent bytes from the same stream; no boundary of its own.
    Inferred,
    /// An explicit record boundary that survives serialization.
    Explicit,
}

/// One run of bytes plus its separation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferElement {
    /// The payload bytes.
    pub bytes: Vec<u8>,
    /// How this run is separated from its predecessor.
    pub separation: SeparationKind,
}

/// Append-only buffer of separated byte runs with a size limit.
#[derive(Debug, Default)]
pub struct SeparatedBuffer {
    elements: Vec<BufferElement>,
    /// Invariant: equals the sum of all element byte lengths.
    size: usize,
    /// Maximum total size in bytes; `0` means unlimited.
    limit: usize,
    discard: bool,
}

impl SeparatedBuffer {
    /// A buffer holding at most `limit` bytes in total; `0` for unlimited.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Append bytes with the given separation. Returns false (and records
    /// nothing) once the buffer is in the discard state or when this append
    /// would overflow the limit — overflow empties the buffer and turns the
    /// discard state on.
    pub fn append(&mut self, bytes: &[u8], separation: SeparationKind) -> bool {
        if self.discard {
            return false;
        }
        // An empty inferred run carries no bytes and no boundary.
        if bytes.is_empty() && separation == SeparationKind::Inferred {
            return true;
        }
        if !self.try_add_size(bytes.len()) {
            return false;
        }
        match (self.elements.last_mut(), separation) {
            // Adjacent inferred runs coalesce, so two consecutive inferred
            // elements never exist.
            (Some(last), SeparationKind::Inferred)
                if last.separation == SeparationKind::Inferred =>
            {
                last.bytes.extend_from_slice(bytes);
            }
            _ => self.elements.push(BufferElement {
                bytes: bytes.to_vec(),
                separation,
            }),
        }
        true
    }

    /// All bytes in order, with a newline emitted after every explicit
    /// element.
    #[must_use]
    pub fn serialize_with_newlines(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size + self.elements.len());
        for element in &self.elements {
            out.extend_from_slice(&element.bytes);
            if element.separation == SeparationKind::Explicit {
                out.push(b'\n');
            }
        }
        out
    }

    /// The recorded elements.
    #[must_use]
    pub fn elements(&self) -> &[BufferElement] { &self.elements }

    /// Total recorded bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.size }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.size == 0 }

    /// The configured limit; `0` means unlimited.
    #[must_use]
    pub fn limit(&self) -> usize { self.limit }

    /// Has the buffer overflowed and dropped its contents?
    #[must_use]
    pub fn is_discarded(&self) -> bool { self.discard }

    /// Leave the discard state so the buffer can be reused.
    pub fn reset_discard(&mut self) { self.discard = false; }

    /// Account for `delta` more bytes. On wrap-around or overflow of the
    /// limit, empty the buffer, enter the discard state, and report false.
    fn try_add_size(&mut self, delta: usize) -> bool {
        let new_size = match self.size.checked_add(delta) {
            Some(new_size) if self.limit == 0 || new_size <= self.limit => new_size,
            _ => {
                tracing::warn!(
                    "output buffer overflow (limit {} bytes); discarding",
                    self.limit
                );
                self.elements.clear();
                self.size = 0;
                self.discard = true;
                return false;
            }
        };
        self.size = new_size;
        true
    }
}
