// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Job groups: the shell's view of a process group.
//!
//! A job group may be *internal* (a lone builtin-ish process, no pgid and no
//! job id), may borrow the shell's own pgid, may adopt the pgid of its first
//! external child, or — for concurrent pipelines that mix script-thread
//! stages with external processes — may *own* a pgid by forking a throwaway
//! leader whose only purpose is to hold the process group open so every later
//! child can join it. Signals (SIGINT, SIGTSTP) then hit the whole mixed
//! pipeline atomically.

use std::sync::{Arc, Mutex, OnceLock};

use nix::{errno::Errno,
          sys::{signal::{Signal, killpg},
                wait::waitpid},
          unistd::{ForkResult, Pid, fork, getpgrp, setpgid}};

use super::JobId;

/// What the launcher knows about a job at group-resolution time.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobProps {
    /// The job should get its own process group (per the job-control mode).
    pub wants_job_control: bool,
    /// The first process must own the terminal.
    pub wants_terminal: bool,
    /// The job was launched with `&`.
    pub is_background: bool,
    /// The job is a single process internal to the shell.
    pub lone_internal_process: bool,
    /// The first process of the job runs inside the shell (not a real
    /// child).
    pub first_process_internal: bool,
}

impl JobProps {
    /// Can this job live in an *internal* group (no pgid, no job id)?
    #[must_use]
    fn internal_eligible(&self) -> bool {
        self.lone_internal_process && !self.is_background && !self.wants_job_control
    }
}

/// One job group. See the module docs for the pgid ownership story.
#[derive(Debug)]
pub struct JobGroup {
    job_id: Option<JobId>,
    wants_job_control: bool,
    wants_terminal: bool,
    is_internal: bool,
    /// Write-once: a group's pgid never changes after it is set.
    pgid: OnceLock<Pid>,
    /// Pid of the forked placeholder leader, reaped exactly once on drop.
    pgid_owner: Mutex<Option<Pid>>,
}

impl JobGroup {
    /// Decide which group a job about to launch runs in: a fresh one or the
    /// parent's.
    ///
    /// A new group is needed when there is no parent, when the job is
    /// backgrounded, or when the parent group is internal and this job is
    /// not eligible to share it. Everything else inherits.
    #[must_use]
    pub fn resolve(parent: Option<&Arc<JobGroup>>, props: &JobProps) -> Arc<JobGroup> {
        let needs_new_group = match parent {
            None => true,
            Some(_) if props.is_background => true,
            Some(parent_group) => parent_group.is_internal && !props.internal_eligible(),
        };
        if !needs_new_group {
            let parent_group = parent.expect("inherit requires a parent group");
            tracing::trace!(
                "job inherits group (job id {:?})",
                parent_group.job_id()
            );
            return Arc::clone(parent_group);
        }

        if props.internal_eligible() {
            tracing::trace!("job runs in a new internal group");
            return Arc::new(JobGroup {
                job_id: None,
                wants_job_control: false,
                wants_terminal: false,
                is_internal: true,
                pgid: OnceLock::new(),
                pgid_owner: Mutex::new(None),
            });
        }

        let group = JobGroup {
            job_id: Some(JobId::acquire()),
            wants_job_control: props.wants_job_control,
            wants_terminal: props.wants_terminal,
            is_internal: false,
            pgid: OnceLock::new(),
            pgid_owner: Mutex::new(None),
        };
        // A group headed by an in-shell process can't take its pgid from a
        // child. When job control is off, or when that first process must
        // own the terminal, the group simply runs in the shell's own pgid.
        if props.first_process_internal && (!props.wants_job_control || props.wants_terminal)
        {
            let shell_pgid = getpgrp();
            let _unused = group.pgid.set(shell_pgid);
        }
        tracing::debug!(
            "new job group: job id {:?}, pgid {:?}",
            group.job_id(),
            group.pgid()
        );
        Arc::new(group)
    }

    /// Does a concurrent pipeline need a forked pgid owner before launch?
    ///
    /// Yes exactly when cooperative execution is on, the group has no pgid
    /// yet, the pipeline has at least two processes, and at least one of
    /// them runs inside the shell — those stages cannot lend the group a
    /// pid of their own.
    #[must_use]
    pub fn needs_pgid_owner(
        &self,
        concurrent: bool,
        process_count: usize,
        any_internal: bool,
    ) -> bool {
        concurrent && self.pgid().is_none() && process_count >= 2 && any_internal
    }

    /// Fork the throwaway leader: the child enters its own process group and
    /// exits immediately; its pid becomes the group's pgid and is reaped when
    /// the group drops.
    ///
    /// Failure is non-fatal by design — the job launches anyway, each
    /// external child ends up in a group of its own, and signal delivery is
    /// merely less atomic.
    pub fn fork_pgid_owner(&self) {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Only async-signal-safe calls between fork and exit.
                let _unused = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                unsafe { nix::libc::_exit(0) };
            }
            Ok(ForkResult::Parent { child }) => {
                // Both sides race to setpgid; whoever runs second is a no-op
                // (or ESRCH once the child is gone, which is fine - the
                // group id stays reserved until the zombie is reaped).
                let _unused = setpgid(child, child);
                let _unused = self.pgid.set(child);
                *self
                    .pgid_owner
                    .lock()
                    .expect("pgid owner slot poisoned") = Some(child);
                tracing::debug!("forked pgid owner {child} for job group");
            }
            Err(errno) => {
                tracing::warn!(
                    "could not fork a pgid owner ({errno}); \
                     external children will get their own pgids"
                );
            }
        }
    }

    /// Adopt `pid` as the group's pgid if none is set yet. Returns the pgid
    /// every process of this group should join.
    pub fn pgid_for_new_child(&self, pid: Pid) -> Pid { *self.pgid.get_or_init(|| pid) }

    /// The group's pgid, if it has one.
    #[must_use]
    pub fn pgid(&self) -> Option<Pid> { self.pgid.get().copied() }

    /// The numeric job id, unless the group is internal.
    #[must_use]
    pub fn job_id(&self) -> Option<u64> { self.job_id.as_ref().map(JobId::get) }

    /// Internal groups have no pgid and no job id.
    #[must_use]
    pub fn is_internal(&self) -> bool { self.is_internal }

    #[must_use]
    pub fn wants_job_control(&self) -> bool { self.wants_job_control }

    #[must_use]
    pub fn wants_terminal(&self) -> bool { self.wants_terminal }

    /// Send a signal to every process in the group at once.
    ///
    /// # Errors
    ///
    /// `ESRCH` when the group has no pgid (nothing to target) or the group
    /// is already gone; any other errno from `killpg`.
    pub fn signal(&self, signal: Signal) -> Result<(), Errno> {
        match self.pgid() {
            Some(pgid) => killpg(pgid, signal),
            None => Err(Errno::ESRCH),
        }
    }
}

impl Drop for JobGroup {
    fn drop(&mut self) {
        let owner = self
            .pgid_owner
            .lock()
            .expect("pgid owner slot poisoned")
            .take();
        if let Some(pid) = owner {
            // Reap the placeholder exactly once.
            loop {
                match waitpid(pid, None) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => {}
                    Err(errno) => {
                        tracing::warn!("could not reap pgid owner {pid}: {errno}");
                        break;
                    }
                }
            }
        }
    }
}
