// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! An opened directory plus the logical path it was opened from.
//!
//! The process-wide working directory must be set with `fchdir(2)` on an
//! already-opened fd, never `chdir(2)` on a path: the directory a script
//! thread resolved may be renamed or replaced between its `cd` and the next
//! time its turn comes around, and the fd pins the object, not the name.

use std::{os::fd::OwnedFd,
          path::{Path, PathBuf}};

use nix::{errno::Errno, fcntl, sys::stat::Mode, unistd};

/// Errors from opening and applying working directories.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CwdError {
    /// The path resolved to something other than a directory.
    #[error("'{}' is not a directory", path.display())]
    #[diagnostic(code(fish_exec::cwd::not_a_directory))]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The directory could not be opened.
    #[error("could not open directory '{}'", path.display())]
    #[diagnostic(
        code(fish_exec::cwd::open),
        help("check that the directory exists and is readable")
    )]
    Open {
        /// The offending path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `fchdir(2)` on the opened directory failed.
    #[error("could not change directory to '{}': {errno}", path.display())]
    #[diagnostic(code(fish_exec::cwd::chdir))]
    Chdir {
        /// The logical path of the directory handle.
        path: PathBuf,
        /// The raw errno from `fchdir`.
        errno: Errno,
    },
}

/// A directory fd opened `O_RDONLY|O_CLOEXEC|O_DIRECTORY`, together with its
/// logical path.
///
/// Handles are shared via `Arc`; two holders "agree" on a directory exactly
/// when they share the same handle allocation.
#[derive(Debug)]
pub struct DirHandle {
    fd: OwnedFd,
    path: PathBuf,
}

impl DirHandle {
    /// Open a directory for later `fchdir`. `O_DIRECTORY` makes the kernel
    /// reject non-directories at open time. The path is stored as given (it
    /// becomes the logical `$PWD` of whoever adopts this handle), so callers
    /// pass absolute paths.
    ///
    /// # Errors
    ///
    /// [`CwdError::NotADirectory`] if the path names a non-directory,
    /// [`CwdError::Open`] for any other open failure.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CwdError> {
        let path = path.into();
        let flags = fcntl::OFlag::O_RDONLY | fcntl::OFlag::O_CLOEXEC | fcntl::OFlag::O_DIRECTORY;
        let fd = fcntl::open(&path, flags, Mode::empty()).map_err(|errno| match errno {
            Errno::ENOTDIR => CwdError::NotADirectory { path: path.clone() },
            errno => CwdError::Open {
                path: path.clone(),
                source: std::io::Error::from_raw_os_error(errno as i32),
            },
        })?;
        Ok(Self { fd, path })
    }

    /// Make this directory the process-wide working directory, retrying on
    /// interruption.
    ///
    /// # Errors
    ///
    /// Any errno from `fchdir` other than `EINTR`.
    pub fn apply(&self) -> Result<(), CwdError> {
        loop {
            match unistd::fchdir(&self.fd) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(CwdError::Chdir {
                        path: self.path.clone(),
                        errno,
                    });
                }
            }
        }
    }

    /// The logical path this handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path { &self.path }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_non_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = DirHandle::open(file.path());
        assert!(matches!(result, Err(CwdError::NotADirectory { .. })));
    }

    #[test]
    fn test_open_rejects_missing_path() {
        let result = DirHandle::open("/definitely/not/a/real/path");
        assert!(matches!(result, Err(CwdError::Open { .. })));
    }

    #[test]
    fn test_open_keeps_logical_path() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DirHandle::open(dir.path()).unwrap();
        assert_eq!(handle.path(), dir.path());
    }
}
