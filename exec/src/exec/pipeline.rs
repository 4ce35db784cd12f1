// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Pipeline launch and job-group integration.
//!
//! A pipeline mixes two kinds of stages. *Internal* stages run inside the
//! shell process as script threads sharing the interpreter lock; *external*
//! stages are forked children placed into the job's process group. The launch
//! sequence decides which group the job runs in, whether a pgid owner must be
//! forked first (concurrent pipeline, no pgid yet, and internal stages that
//! cannot lend the group a pid), wires the stages together with
//! close-on-exec pipes, and then either waits in the foreground (interpreter
//! lock released) or parks the job in the background table for `jobs`/`wait`.
//!
//! With the `concurrent` feature off there are no extra script threads:
//! internal stages run one after another on the calling thread, adjacent
//! stages connected through background pipe drains so a stage can finish
//! writing before its consumer ever starts reading.

use std::{ffi::CString,
          fs::File,
          io::Write,
          os::fd::{AsFd, FromRawFd, OwnedFd, RawFd},
          sync::{Arc, Mutex}};

use nix::{errno::Errno,
          fcntl::OFlag,
          sys::{signal::Signal,
                wait::{WaitPidFlag, WaitStatus, waitpid}},
          unistd::{self, ForkResult, Pid, fork, pipe2}};

use crate::{buffer::BufferFill,
            common::Latch,
            flags::FeatureFlag,
            job::{JobGroup, JobProps},
            parser::Parser,
            sched::ScriptThreadId,
            status::{PipeStatusList, STATUS_CMD_ERROR, STATUS_CMD_UNKNOWN,
                     STATUS_NOT_EXECUTABLE, STATUS_WAIT_INTERRUPTED, Statuses,
                     status_from_signal}};

use super::Executor;

/// Descriptors handed to a pipeline stage. `None` means "inherit the
/// shell's".
#[derive(Debug, Default)]
pub struct StageIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
}

/// Body of an internal pipeline stage. Runs with the interpreter lock held;
/// use [`Executor::write_blocking`] / [`Executor::read_all_blocking`] for the
/// pipe ends so the lock is dropped around the syscalls.
pub type StageBody = Box<dyn FnOnce(&mut Parser, &Arc<Executor>, StageIo) -> i32 + Send + 'static>;

/// One process of a pipeline, before launch.
pub enum ProcSpec {
    /// Runs inside the shell (builtin, function, block).
    Internal {
        /// Shown by `jobs` and in logs.
        desc: String,
        body: StageBody,
    },
    /// A real child process, `fork`/`execvp`ed.
    External {
        /// Program and arguments.
        argv: Vec<String>,
    },
}

impl ProcSpec {
    /// An internal stage.
    pub fn internal(
        desc: impl Into<String>,
        body: impl FnOnce(&mut Parser, &Arc<Executor>, StageIo) -> i32 + Send + 'static,
    ) -> Self {
        ProcSpec::Internal {
            desc: desc.into(),
            body: Box::new(body),
        }
    }

    /// An external stage.
    pub fn external(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ProcSpec::External {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    fn is_internal(&self) -> bool { matches!(self, ProcSpec::Internal { .. }) }
}

impl std::fmt::Debug for ProcSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcSpec::Internal { desc, .. } => {
                f.debug_struct("Internal").field("desc", desc).finish()
            }
            ProcSpec::External { argv } => {
                f.debug_struct("External").field("argv", argv).finish()
            }
        }
    }
}

/// A whole pipeline, ready to launch.
#[derive(Debug)]
pub struct PipelineSpec {
    pub procs: Vec<ProcSpec>,
    /// Launched with `&`.
    pub background: bool,
    /// The first process must own the terminal.
    pub wants_terminal: bool,
    /// Shown by `jobs`.
    pub desc: String,
}

impl PipelineSpec {
    #[must_use]
    pub fn new(desc: impl Into<String>) -> Self {
        Self {
            procs: Vec::new(),
            background: false,
            wants_terminal: false,
            desc: desc.into(),
        }
    }

    #[must_use]
    pub fn stage(mut self, proc: ProcSpec) -> Self {
        self.procs.push(proc);
        self
    }

    #[must_use]
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// What launching a pipeline produced.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Ran in the foreground; the last stage's status.
    Completed(i32),
    /// Parked in the background job table.
    Backgrounded(Arc<BackgroundJob>),
}

/// How one launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcOutcome {
    Exited(i32),
    Signalled(Signal),
}

impl ProcOutcome {
    fn status(self) -> i32 {
        match self {
            ProcOutcome::Exited(status) => status,
            ProcOutcome::Signalled(signal) => status_from_signal(signal as i32),
        }
    }
}

/// A launched process of a pipeline.
#[derive(Debug)]
enum LaunchedProc {
    /// Internal stage; its exit status arrives on the latch.
    Internal(Arc<Latch<i32>>),
    /// Forked child.
    External(Pid),
    /// Launch itself failed; the status stands in for the process.
    Failed(i32),
}

#[derive(Debug)]
struct ProcSlot {
    launched: LaunchedProc,
    outcome: Option<ProcOutcome>,
}

/// Observable state of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// All processes exited; the last stage's status.
    Exited(i32),
    /// At least one process was killed by a signal.
    Signalled(Signal),
}

/// A backgrounded pipeline, held in the executor's job table.
#[derive(Debug)]
pub struct BackgroundJob {
    desc: String,
    group: Arc<JobGroup>,
    procs: Mutex<Vec<ProcSlot>>,
}

/// One line of `jobs` output, as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsEntry {
    pub job_id: Option<u64>,
    pub pgid: Option<RawFd>,
    pub state: JobState,
    pub desc: String,
}

impl BackgroundJob {
    #[must_use]
    pub fn desc(&self) -> &str { &self.desc }

    #[must_use]
    pub fn group(&self) -> &Arc<JobGroup> { &self.group }

    /// Poll the job's processes (reaping any external that already exited)
    /// and report the aggregate state.
    #[must_use]
    pub fn state(&self) -> JobState {
        let mut procs = self.procs.lock().expect("background job poisoned");
        for slot in procs.iter_mut() {
            if slot.outcome.is_some() {
                continue;
            }
            slot.outcome = match &slot.launched {
                LaunchedProc::Internal(done) => done.try_get().map(ProcOutcome::Exited),
                LaunchedProc::External(pid) => {
                    match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => None,
                        Ok(WaitStatus::Exited(_, status)) => {
                            Some(ProcOutcome::Exited(status))
                        }
                        Ok(WaitStatus::Signaled(_, signal, _)) => {
                            Some(ProcOutcome::Signalled(signal))
                        }
                        Ok(_) => None,
                        Err(errno) => {
                            tracing::warn!("polling background {pid} failed: {errno}");
                            Some(ProcOutcome::Exited(STATUS_CMD_ERROR))
                        }
                    }
                }
                LaunchedProc::Failed(status) => Some(ProcOutcome::Exited(*status)),
            };
        }
        aggregate_state(&procs)
    }

    /// Block until every process finishes, or until `interrupted` reports
    /// true. Returns the last stage's status, or `None` when interrupted.
    fn wait_blocking(&self, interrupted: &dyn Fn() -> bool) -> Option<i32> {
        // Collect handles first so the mutex is not held while blocking.
        let pending: Vec<(usize, Pid)>;
        let latches: Vec<(usize, Arc<Latch<i32>>)>;
        {
            let procs = self.procs.lock().expect("background job poisoned");
            pending = procs
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| match (&slot.launched, slot.outcome) {
                    (LaunchedProc::External(pid), None) => Some((index, *pid)),
                    _ => None,
                })
                .collect();
            latches = procs
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| match (&slot.launched, slot.outcome) {
                    (LaunchedProc::Internal(done), None) => {
                        Some((index, Arc::clone(done)))
                    }
                    _ => None,
                })
                .collect();
        }

        for (index, done) in latches {
            let status = done.wait_interruptible(|| interrupted())?;
            self.record(index, ProcOutcome::Exited(status));
        }
        for (index, pid) in pending {
            let outcome = wait_for_pid(pid, interrupted)?;
            self.record(index, outcome);
        }

        let procs = self.procs.lock().expect("background job poisoned");
        match aggregate_state(&procs) {
            JobState::Exited(status) => Some(status),
            JobState::Signalled(signal) => Some(status_from_signal(signal as i32)),
            JobState::Running => None,
        }
    }

    fn record(&self, index: usize, outcome: ProcOutcome) {
        let mut procs = self.procs.lock().expect("background job poisoned");
        procs[index].outcome = Some(outcome);
    }
}

fn aggregate_state(procs: &[ProcSlot]) -> JobState {
    if procs.iter().any(|slot| slot.outcome.is_none()) {
        return JobState::Running;
    }
    let signalled = procs.iter().rev().find_map(|slot| match slot.outcome {
        Some(ProcOutcome::Signalled(signal)) => Some(signal),
        _ => None,
    });
    if let Some(signal) = signalled {
        return JobState::Signalled(signal);
    }
    let last = procs
        .last()
        .and_then(|slot| slot.outcome)
        .map_or(0, ProcOutcome::status);
    JobState::Exited(last)
}

/// Blocking reap of one pid. Returns `None` when `interrupted` reports true
/// while waiting.
fn wait_for_pid(pid: Pid, interrupted: &dyn Fn() -> bool) -> Option<ProcOutcome> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, status)) => return Some(ProcOutcome::Exited(status)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Some(ProcOutcome::Signalled(signal));
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {
                if interrupted() {
                    return None;
                }
            }
            Err(errno) => {
                tracing::warn!("waitpid({pid}) failed: {errno}");
                return Some(ProcOutcome::Exited(STATUS_CMD_ERROR));
            }
        }
    }
}

impl Executor {
    /// Launch a pipeline from `parser`'s context.
    ///
    /// # Errors
    ///
    /// Fails on an empty pipeline, when pipe plumbing cannot be created, or
    /// when an internal multi-stage pipeline is requested while the
    /// `concurrent` feature is off and buffering fails.
    pub fn run_pipeline(
        self: &Arc<Self>,
        parser: &mut Parser,
        spec: PipelineSpec,
    ) -> miette::Result<PipelineOutcome> {
        if spec.procs.is_empty() {
            miette::bail!("pipeline has no processes");
        }
        let concurrent = self.features().test(FeatureFlag::Concurrent);
        let count = spec.procs.len();
        let any_internal = spec.procs.iter().any(ProcSpec::is_internal);
        let first_internal = spec.procs[0].is_internal();

        let props = JobProps {
            wants_job_control: self
                .job_control_mode()
                .wants_job_control(self.is_interactive()),
            wants_terminal: spec.wants_terminal,
            is_background: spec.background,
            lone_internal_process: count == 1 && first_internal,
            first_process_internal: first_internal,
        };
        let group = JobGroup::resolve(parser.job_group(), &props);
        parser.note_job(Arc::clone(&group));

        if group.needs_pgid_owner(concurrent, count, any_internal) {
            // Pin the cwd for the fork; the interpreter lock is held the
            // whole time, so no other script thread can move it anyway.
            let cwd_pin = self.chdir().acquire(&self.cwd().current());
            if let Err(error) = &cwd_pin {
                tracing::warn!("could not pin cwd for pgid owner fork: {error}");
            }
            group.fork_pgid_owner();
        }

        if !concurrent && any_internal && count > 1 {
            let statuses = self.run_pipeline_sequential(parser, &group, spec.procs)?;
            self.set_pipeline_status(statuses.clone());
            parser.retire_job(&group);
            let last = statuses.last().copied().unwrap_or(0);
            return Ok(PipelineOutcome::Completed(last));
        }

        let slots = self.launch_stages(parser, &group, spec.procs)?;
        let job = Arc::new(BackgroundJob {
            desc: spec.desc,
            group: Arc::clone(&group),
            procs: Mutex::new(slots),
        });

        if spec.background {
            self.background_jobs
                .lock()
                .expect("background job table poisoned")
                .push(Arc::clone(&job));
            self.set_status(0);
            tracing::debug!(
                "backgrounded job '{}' (job id {:?}, pgid {:?})",
                job.desc(),
                group.job_id(),
                group.pgid()
            );
            return Ok(PipelineOutcome::Backgrounded(job));
        }

        let statuses = self.wait_foreground(parser.tid(), &job);
        self.set_pipeline_status(statuses.clone());
        parser.retire_job(&group);
        let last = statuses.last().copied().unwrap_or(0);
        Ok(PipelineOutcome::Completed(last))
    }

    /// `wait` on a backgrounded job: block with the interpreter lock
    /// released until it finishes, adopt its status, and retire it from the
    /// job table. An interrupt abandons the wait with
    /// [`STATUS_WAIT_INTERRUPTED`]; the job keeps running.
    pub fn wait_job(&self, waiter: &Parser, job: &Arc<BackgroundJob>) -> i32 {
        let signals = self.signals();
        let outcome = self.unlocked(waiter.tid(), || {
            job.wait_blocking(&|| signals.cancel_requested())
        });
        let status = match outcome {
            Some(status) => {
                self.background_jobs
                    .lock()
                    .expect("background job table poisoned")
                    .retain(|entry| !Arc::ptr_eq(entry, job));
                status
            }
            None => {
                signals.clear();
                STATUS_WAIT_INTERRUPTED
            }
        };
        self.set_status(status);
        status
    }

    /// Handles of all live background jobs, oldest first.
    #[must_use]
    pub fn background_job_list(&self) -> Vec<Arc<BackgroundJob>> {
        self.background_jobs
            .lock()
            .expect("background job table poisoned")
            .clone()
    }

    /// `wait` with no arguments: collect background jobs until the table is
    /// empty, including jobs that running stages background in the meantime.
    /// Returns the last collected status (or [`STATUS_WAIT_INTERRUPTED`]).
    pub fn wait_all_jobs(&self, waiter: &Parser) -> i32 {
        let mut last = 0;
        loop {
            let Some(job) = self.background_job_list().into_iter().next() else {
                break;
            };
            last = self.wait_job(waiter, &job);
            if last == STATUS_WAIT_INTERRUPTED {
                break;
            }
        }
        last
    }

    /// The `jobs` table: one entry per live background job.
    #[must_use]
    pub fn jobs_snapshot(&self) -> Vec<JobsEntry> {
        self.background_jobs
            .lock()
            .expect("background job table poisoned")
            .iter()
            .map(|job| JobsEntry {
                job_id: job.group().job_id(),
                pgid: job.group().pgid().map(Pid::as_raw),
                state: job.state(),
                desc: job.desc().to_string(),
            })
            .collect()
    }

    /// Drop background jobs that have finished (what `jobs` does after
    /// reporting them).
    pub fn retire_finished_jobs(&self) {
        self.background_jobs
            .lock()
            .expect("background job table poisoned")
            .retain(|job| job.state() == JobState::Running);
    }

    /// Write all of `bytes` to `fd` with the interpreter lock released.
    ///
    /// # Errors
    ///
    /// Any errno from `write` except `EINTR` (which is retried).
    pub fn write_blocking(
        &self,
        tid: ScriptThreadId,
        fd: &OwnedFd,
        bytes: &[u8],
    ) -> Result<(), Errno> {
        self.unlocked(tid, || {
            let mut written = 0;
            while written < bytes.len() {
                match unistd::write(fd.as_fd(), &bytes[written..]) {
                    Ok(count) => written += count,
                    Err(Errno::EINTR) => {}
                    Err(errno) => return Err(errno),
                }
            }
            Ok(())
        })
    }

    /// Read `fd` to EOF with the interpreter lock released.
    ///
    /// # Errors
    ///
    /// Any errno from `read` except `EINTR` (which is retried).
    pub fn read_all_blocking(
        &self,
        tid: ScriptThreadId,
        fd: &OwnedFd,
    ) -> Result<Vec<u8>, Errno> {
        self.unlocked(tid, || {
            let mut out = Vec::new();
            let mut chunk = [0_u8; 4096];
            loop {
                match unistd::read(fd.as_fd(), &mut chunk) {
                    Ok(0) => return Ok(out),
                    Ok(count) => out.extend_from_slice(&chunk[..count]),
                    Err(Errno::EINTR) => {}
                    Err(errno) => return Err(errno),
                }
            }
        })
    }

    // -- Launch internals. --

    /// Launch every stage, wiring adjacent ones with close-on-exec pipes.
    fn launch_stages(
        self: &Arc<Self>,
        parser: &Parser,
        group: &Arc<JobGroup>,
        procs: Vec<ProcSpec>,
    ) -> miette::Result<Vec<ProcSlot>> {
        let count = procs.len();
        let mut slots = Vec::with_capacity(count);
        let mut carry_read: Option<OwnedFd> = None;

        for (index, proc) in procs.into_iter().enumerate() {
            let is_last = index + 1 == count;
            let (stdout, next_read) = if is_last {
                (None, None)
            } else {
                let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
                    .map_err(|errno| miette::miette!("pipe failed: {errno}"))?;
                (Some(write_end), Some(read_end))
            };
            let io = StageIo {
                stdin: carry_read.take(),
                stdout,
            };

            let launched = match proc {
                ProcSpec::Internal { desc, body } => {
                    match self.spawn_stage(parser, Arc::clone(group), body, io) {
                        Ok(done) => LaunchedProc::Internal(done),
                        Err(error) => {
                            tracing::warn!("could not launch stage '{desc}': {error}");
                            LaunchedProc::Failed(STATUS_CMD_ERROR)
                        }
                    }
                }
                ProcSpec::External { argv } => {
                    // Keep the process cwd pinned to this thread's directory
                    // across the fork.
                    let cwd_pin = self.chdir().acquire(&self.cwd().current());
                    if let Err(error) = &cwd_pin {
                        tracing::warn!("could not pin cwd for fork: {error}");
                    }
                    match spawn_external(group, &argv, io) {
                        Ok(pid) => LaunchedProc::External(pid),
                        Err(errno) => {
                            tracing::warn!("could not fork for {argv:?}: {errno}");
                            LaunchedProc::Failed(STATUS_CMD_UNKNOWN)
                        }
                    }
                }
            };
            slots.push(ProcSlot {
                launched,
                outcome: None,
            });
            carry_read = next_read;
        }
        Ok(slots)
    }

    /// Run an internal stage on its own script thread within `group`.
    fn spawn_stage(
        self: &Arc<Self>,
        parent: &Parser,
        group: Arc<JobGroup>,
        body: StageBody,
        io: StageIo,
    ) -> Result<Arc<Latch<i32>>, std::io::Error> {
        let tid = self.gil().spawn();
        self.statuses_var().put(tid, Statuses::default());

        let mut child = Parser::branch_from(parent, tid);
        child.set_job_group(Some(group));
        let done = Arc::new(Latch::new());

        let executor = Arc::clone(self);
        let thread_done = Arc::clone(&done);
        let spawned = std::thread::Builder::new()
            .name(tid.to_string())
            .spawn(move || {
                executor.gil().run(tid);
                let status = body(&mut child, &executor, io);
                drop(child);
                executor.gil().release(tid);
                executor.gil().destroy(tid);
                thread_done.set(status);
            });
        match spawned {
            Ok(_join_handle) => Ok(done),
            Err(error) => {
                self.gil().destroy(tid);
                Err(error)
            }
        }
    }

    /// Foreground wait: collect every stage's status in order, interpreter
    /// lock released. A SIGINT forwards to the whole group once, then the
    /// wait continues until the (now dying) stages are collected.
    fn wait_foreground(&self, tid: ScriptThreadId, job: &BackgroundJob) -> PipeStatusList {
        let signals = self.signals();
        let group = Arc::clone(&job.group);
        let statuses = self.unlocked(tid, || {
            let forwarded = std::cell::Cell::new(false);
            let interrupt_check = || {
                if !forwarded.get() && signals.cancel_requested() {
                    forwarded.set(true);
                    if let Err(errno) = group.signal(Signal::SIGINT) {
                        tracing::debug!("could not forward SIGINT to group: {errno}");
                    }
                }
                // Never abandon a foreground wait; the signal forward above
                // makes the stages exit on their own.
                false
            };

            let procs = job.procs.lock().expect("background job poisoned");
            let handles: Vec<(usize, LaunchedHandle)> = procs
                .iter()
                .enumerate()
                .map(|(index, slot)| {
                    let handle = match &slot.launched {
                        LaunchedProc::Internal(done) => {
                            LaunchedHandle::Internal(Arc::clone(done))
                        }
                        LaunchedProc::External(pid) => LaunchedHandle::External(*pid),
                        LaunchedProc::Failed(status) => LaunchedHandle::Failed(*status),
                    };
                    (index, handle)
                })
                .collect();
            drop(procs);

            let mut out = PipeStatusList::new();
            for (index, handle) in handles {
                let outcome = match handle {
                    LaunchedHandle::Internal(done) => {
                        let status = done
                            .wait_interruptible(&interrupt_check)
                            .expect("foreground wait never abandons");
                        ProcOutcome::Exited(status)
                    }
                    LaunchedHandle::External(pid) => {
                        wait_for_pid(pid, &interrupt_check)
                            .expect("foreground wait never abandons")
                    }
                    LaunchedHandle::Failed(status) => ProcOutcome::Exited(status),
                };
                job.record(index, outcome);
                out.push(outcome.status());
            }
            out
        });
        if signals.cancel_requested() {
            signals.clear();
        }
        statuses
    }

    /// Single-threaded pipeline: stages run in order on the calling thread,
    /// with each internal stage's output drained into a buffer by a
    /// background reader and replayed into the next stage through a feeder
    /// pipe.
    fn run_pipeline_sequential(
        self: &Arc<Self>,
        parser: &mut Parser,
        group: &Arc<JobGroup>,
        procs: Vec<ProcSpec>,
    ) -> miette::Result<PipeStatusList> {
        let count = procs.len();
        let mut statuses = PipeStatusList::new();
        let mut carry: Option<Vec<u8>> = None;

        for (index, proc) in procs.into_iter().enumerate() {
            let is_last = index + 1 == count;
            let stdin = match carry.take() {
                Some(bytes) => Some(feeder_fd(bytes)?),
                None => None,
            };
            let (stdout, fill) = if is_last {
                (None, None)
            } else {
                let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
                    .map_err(|errno| miette::miette!("pipe failed: {errno}"))?;
                let fill = BufferFill::start(read_end, 0)?;
                (Some(write_end), Some(fill))
            };
            let io = StageIo { stdin, stdout };

            let status = match proc {
                ProcSpec::Internal { body, .. } => {
                    // Subshell semantics on the same thread: a branched
                    // parser, discarded when the stage ends.
                    let mut stage_parser = Parser::branch_from(parser, parser.tid());
                    stage_parser.set_job_group(Some(Arc::clone(group)));
                    let status = body(&mut stage_parser, self, io);
                    drop(stage_parser);
                    status
                }
                ProcSpec::External { argv } => {
                    let cwd_pin = self.chdir().acquire(&self.cwd().current());
                    if let Err(error) = &cwd_pin {
                        tracing::warn!("could not pin cwd for fork: {error}");
                    }
                    match spawn_external(group, &argv, io) {
                        Ok(pid) => {
                            drop(cwd_pin);
                            self.unlocked(parser.tid(), || {
                                wait_for_pid(pid, &|| false)
                                    .expect("uninterruptible wait")
                                    .status()
                            })
                        }
                        Err(errno) => {
                            tracing::warn!("could not fork for {argv:?}: {errno}");
                            STATUS_CMD_UNKNOWN
                        }
                    }
                }
            };
            statuses.push(status);

            if let Some(fill) = fill {
                self.unlocked(parser.tid(), || fill.wait_until_done());
                carry = Some(fill.buffer().serialize_with_newlines());
            }
        }
        Ok(statuses)
    }
}

/// Internal mirror of [`LaunchedProc`] that owns its handles, so the job
/// mutex is not held while blocking.
enum LaunchedHandle {
    Internal(Arc<Latch<i32>>),
    External(Pid),
    Failed(i32),
}

/// Fork and exec one external stage, joining it to the group's process
/// group. Called with the interpreter lock held and the cwd pinned.
fn spawn_external(group: &JobGroup, argv: &[String], io: StageIo) -> Result<Pid, Errno> {
    if argv.is_empty() {
        return Err(Errno::EINVAL);
    }
    // All allocation happens before the fork; the child may only make
    // async-signal-safe calls.
    let program = CString::new(argv[0].as_bytes()).map_err(|_| Errno::EINVAL)?;
    let args: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()).map_err(|_| Errno::EINVAL))
        .collect::<Result<_, _>>()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            if group.wants_job_control() || group.pgid().is_some() {
                let target = group.pgid().unwrap_or_else(|| Pid::from_raw(0));
                let _unused = unistd::setpgid(Pid::from_raw(0), target);
            }
            if let Some(fd) = io.stdin {
                redirect_into(fd, 0);
            }
            if let Some(fd) = io.stdout {
                redirect_into(fd, 1);
            }
            let errno = match unistd::execvp(&program, &args) {
                Err(errno) => errno,
                Ok(infallible) => match infallible {},
            };
            let status = if errno == Errno::ENOENT {
                STATUS_CMD_UNKNOWN
            } else {
                STATUS_NOT_EXECUTABLE
            };
            unsafe { nix::libc::_exit(status) };
        }
        ForkResult::Parent { child } => {
            if group.wants_job_control() || group.pgid().is_some() {
                let join = group.pgid_for_new_child(child);
                if let Err(errno) = unistd::setpgid(child, join) {
                    // ESRCH/EACCES lose the race benignly; anything else
                    // degrades to a per-child group.
                    if errno != Errno::ESRCH && errno != Errno::EACCES {
                        tracing::warn!(
                            "setpgid({child}, {join}) failed ({errno}); \
                             child keeps its own group"
                        );
                        let _unused = unistd::setpgid(child, child);
                    }
                }
            }
            tracing::trace!("forked {child} for {argv:?}");
            Ok(child)
        }
    }
}

/// In the forked child: make `fd` the given standard descriptor.
fn redirect_into(fd: OwnedFd, std_fd: RawFd) {
    let mut target = unsafe { OwnedFd::from_raw_fd(std_fd) };
    let _unused = unistd::dup2(&fd, &mut target);
    // The wrapper must not close the standard descriptor it borrowed.
    std::mem::forget(target);
}

/// Replay buffered bytes into a fresh pipe from a background writer thread;
/// returns the read end.
fn feeder_fd(bytes: Vec<u8>) -> miette::Result<OwnedFd> {
    let (read_end, write_end) =
        pipe2(OFlag::O_CLOEXEC).map_err(|errno| miette::miette!("pipe failed: {errno}"))?;
    std::thread::Builder::new()
        .name("pipe-feeder".into())
        .spawn(move || {
            let mut writer = File::from(write_end);
            // EPIPE just means the consumer stopped reading early.
            let _unused = writer.write_all(&bytes);
        })
        .map_err(|error| miette::miette!("could not spawn pipe feeder: {error}"))?;
    Ok(read_end)
}
