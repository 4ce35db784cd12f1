// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The executor: process-wide home of the scheduler and the per-thread shell
//! state.
//!
//! One [`Executor`] exists per shell process. It owns the interpreter lock,
//! the per-thread `$status` and cwd holders (registered as scheduler
//! observers before any thread is spawned), the shared variable tables, the
//! chdir serializer, the feature flags, and the background job table.

use std::{path::{Path, PathBuf},
          sync::{Arc, Mutex,
                 atomic::{AtomicBool, Ordering}}};

use miette::IntoDiagnostic;

use crate::{cwd::{ChdirSerializer, CwdError, CwdObserver, DirHandle},
            flags::FeatureSet,
            job::JobControlMode,
            parser::{EventHandlers, FunctionTable, GlobalVars, Parser},
            sched::{Gil, PerThreadVar, ScriptThreadId, SchedulerObserver},
            signal::{SignalChecker, ignore_sigpipe, install_sigint_handler},
            status::{PipeStatusList, Statuses}};

use super::BackgroundJob;

/// Process-wide execution state. Create exactly one, early, before any
/// script runs.
#[allow(missing_debug_implementations)]
pub struct Executor {
    gil: Arc<Gil>,
    statuses: Arc<PerThreadVar<Statuses>>,
    cwd: Arc<CwdObserver>,
    chdir: Arc<ChdirSerializer>,
    globals: Arc<GlobalVars>,
    universals: Arc<GlobalVars>,
    functions: Arc<FunctionTable>,
    events: Arc<EventHandlers>,
    features: FeatureSet,
    job_control: Mutex<JobControlMode>,
    interactive: AtomicBool,
    signals: SignalChecker,
    pub(super) background_jobs: Mutex<Vec<Arc<BackgroundJob>>>,
}

impl Executor {
    /// Build the executor and wire the per-thread state holders into the
    /// scheduler. Also sets the process signal dispositions the execution
    /// core relies on (SIGPIPE ignored, SIGINT noted as a flag).
    ///
    /// # Errors
    ///
    /// Fails when the current working directory cannot be opened.
    pub fn new() -> miette::Result<Arc<Self>> {
        if let Err(errno) = ignore_sigpipe() {
            tracing::warn!("could not ignore SIGPIPE: {errno}");
        }
        if let Err(errno) = install_sigint_handler() {
            tracing::warn!("could not install SIGINT handler: {errno}");
        }

        let gil = Arc::new(Gil::new());
        let chdir = Arc::new(ChdirSerializer::new());
        let statuses = Arc::new(PerThreadVar::new("statuses", Statuses::default()));
        let cwd = Arc::new(CwdObserver::new(Arc::clone(&chdir)).into_diagnostic()?);

        gil.register_observer(Arc::clone(&statuses) as Arc<dyn SchedulerObserver>);
        gil.register_observer(Arc::clone(&cwd) as Arc<dyn SchedulerObserver>);

        Ok(Arc::new(Self {
            gil,
            statuses,
            cwd,
            chdir,
            globals: Arc::new(GlobalVars::new()),
            universals: Arc::new(GlobalVars::new()),
            functions: Arc::new(FunctionTable::new()),
            events: Arc::new(EventHandlers::new()),
            features: FeatureSet::new(),
            job_control: Mutex::new(JobControlMode::default()),
            interactive: AtomicBool::new(false),
            signals: SignalChecker::new(),
            background_jobs: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn and schedule the root script thread, returning its parser. The
    /// calling OS thread becomes the root script thread and keeps the
    /// interpreter lock until it blocks or finishes.
    #[must_use]
    pub fn root(self: &Arc<Self>) -> Parser {
        let tid = self.gil.spawn();
        self.gil.run(tid);
        Parser::new_root(
            tid,
            Arc::clone(&self.globals),
            Arc::clone(&self.universals),
            Arc::clone(&self.functions),
            Arc::clone(&self.events),
        )
    }

    /// Tear down a root parser: release the lock and deregister the thread.
    pub fn finish_root(&self, parser: Parser) {
        let tid = parser.tid();
        drop(parser);
        self.gil.release(tid);
        self.gil.destroy(tid);
    }

    // -- Scheduler access. --

    /// The interpreter lock.
    #[must_use]
    pub fn gil(&self) -> &Arc<Gil> { &self.gil }

    /// Cooperative yield point for long-running script loops.
    pub fn yield_now(&self, parser: &Parser) { self.gil.yield_now(parser.tid()); }

    /// Release the interpreter lock around `blocking_work`, reacquire after.
    pub fn unlocked<R>(
        &self,
        tid: ScriptThreadId,
        blocking_work: impl FnOnce() -> R,
    ) -> R {
        self.gil.unlocked(tid, blocking_work)
    }

    // -- Statuses. --

    /// The scheduled thread's `$status`.
    #[must_use]
    pub fn status(&self) -> i32 { self.statuses.get().status }

    /// The scheduled thread's `$status` / `$pipestatus` pair.
    #[must_use]
    pub fn statuses(&self) -> Statuses { self.statuses.get() }

    /// Record a single command status.
    pub fn set_status(&self, status: i32) { self.statuses.set(Statuses::just(status)); }

    /// Record a completed pipeline's statuses.
    pub fn set_pipeline_status(&self, pipestatus: PipeStatusList) {
        self.statuses.set(Statuses::from_pipeline(pipestatus));
    }

    pub(super) fn statuses_var(&self) -> &Arc<PerThreadVar<Statuses>> { &self.statuses }

    // -- Working directory. --

    /// The scheduled thread's logical `$PWD`.
    #[must_use]
    pub fn pwd(&self) -> PathBuf { self.cwd.current().path().to_path_buf() }

    /// Change the scheduled thread's directory. Relative paths resolve
    /// against its current `$PWD`. Other threads are unaffected.
    ///
    /// # Errors
    ///
    /// See [`CwdError`]; on error the thread's cwd is unchanged.
    pub fn cd(&self, path: impl AsRef<Path>) -> Result<(), CwdError> {
        let path = path.as_ref();
        let current = self.cwd.current();
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            current.path().join(path)
        };
        let handle = Arc::new(DirHandle::open(target)?);
        // Point the process cwd at the new directory and swap the live
        // handle while it is pinned, so the serializer cache and the
        // per-thread view stay in agreement.
        let guard = self.chdir.acquire(&handle)?;
        self.cwd.set_current(Arc::clone(&handle));
        drop(guard);
        tracing::debug!("cwd now '{}'", handle.path().display());
        Ok(())
    }

    /// The chdir serializer, for callers that need the process cwd pinned
    /// across a `fork`.
    #[must_use]
    pub fn chdir(&self) -> &Arc<ChdirSerializer> { &self.chdir }

    /// The cwd observer.
    #[must_use]
    pub fn cwd(&self) -> &Arc<CwdObserver> { &self.cwd }

    // -- Shared tables. --

    #[must_use]
    pub fn globals(&self) -> &Arc<GlobalVars> { &self.globals }

    #[must_use]
    pub fn universals(&self) -> &Arc<GlobalVars> { &self.universals }

    #[must_use]
    pub fn functions(&self) -> &Arc<FunctionTable> { &self.functions }

    #[must_use]
    pub fn events(&self) -> &Arc<EventHandlers> { &self.events }

    // -- Modes and flags. --

    #[must_use]
    pub fn features(&self) -> &FeatureSet { &self.features }

    #[must_use]
    pub fn signals(&self) -> SignalChecker { self.signals }

    /// The current `status job-control` mode.
    #[must_use]
    pub fn job_control_mode(&self) -> JobControlMode {
        *self.job_control.lock().expect("job control mode poisoned")
    }

    /// Set the `status job-control` mode.
    pub fn set_job_control_mode(&self, mode: JobControlMode) {
        *self.job_control.lock().expect("job control mode poisoned") = mode;
        tracing::debug!("job control mode now '{mode}'");
    }

    #[must_use]
    pub fn is_interactive(&self) -> bool { self.interactive.load(Ordering::SeqCst) }

    pub fn set_interactive(&self, interactive: bool) {
        self.interactive.store(interactive, Ordering::SeqCst);
    }
}
