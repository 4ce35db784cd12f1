// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The parser: the state container of one unit of script execution.
//!
//! Each parser is owned by exactly one script thread at a time, and its state
//! is only touched by that thread while it holds the interpreter lock.
//! Branching a parser is how subshells and parallel pipeline stages come to
//! exist: the child copies the parent's visible locals as a read-only seed
//! and shares everything table-like (globals, universals, event handlers) by
//! reference.

use std::{collections::HashMap,
          os::fd::OwnedFd,
          sync::Arc};

use super::{EventHandlers, FunctionTable, GlobalVars, TraceFrame, VarValue};
use crate::{job::JobGroup, sched::ScriptThreadId};

/// What kind of construct opened a local scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// A function body; `set -l` at function level lands here.
    Function,
    /// A block (`begin`/`if`/`while`...); popped when the block closes.
    Block,
}

/// One local variable scope.
#[derive(Debug)]
struct LocalScope {
    kind: ScopeKind,
    vars: HashMap<String, VarValue>,
}

/// Execution state for one script thread.
#[derive(Debug)]
pub struct Parser {
    tid: ScriptThreadId,
    globals: Arc<GlobalVars>,
    universals: Arc<GlobalVars>,
    functions: Arc<FunctionTable>,
    events: Arc<EventHandlers>,
    /// Parent locals frozen at branch time. Reads fall through to it; writes
    /// always land in a live scope, so mutating a seeded name rebinds it
    /// locally and the parent never observes the change.
    seed: HashMap<String, VarValue>,
    /// Innermost scope last. Never empty.
    scopes: Vec<LocalScope>,
    backtrace: Vec<TraceFrame>,
    /// The group the parser's current job runs within, if any.
    job_group: Option<Arc<JobGroup>>,
    /// Groups of jobs this parser launched, oldest first. Foreground
    /// launches are retired when they complete; backgrounded ones stay until
    /// the parser is torn down.
    jobs: Vec<Arc<JobGroup>>,
    /// Descriptors opened on behalf of this parser; closed at teardown.
    owned_fds: Vec<OwnedFd>,
}

impl Parser {
    /// A root parser with empty state.
    #[must_use]
    pub fn new_root(
        tid: ScriptThreadId,
        globals: Arc<GlobalVars>,
        universals: Arc<GlobalVars>,
        functions: Arc<FunctionTable>,
        events: Arc<EventHandlers>,
    ) -> Self {
        Self {
            tid,
            globals,
            universals,
            functions,
            events,
            seed: HashMap::new(),
            scopes: vec![LocalScope {
                kind: ScopeKind::Function,
                vars: HashMap::new(),
            }],
            backtrace: Vec::new(),
            job_group: None,
            jobs: Vec::new(),
            owned_fds: Vec::new(),
        }
    }

    /// A child parser seeded from `parent`, owned by `child_tid`.
    #[must_use]
    pub fn branch_from(parent: &Parser, child_tid: ScriptThreadId) -> Self {
        let mut seed = parent.seed.clone();
        // Outer scopes first so inner bindings win.
        for scope in &parent.scopes {
            for (name, value) in &scope.vars {
                seed.insert(name.clone(), value.clone());
            }
        }
        Self {
            tid: child_tid,
            globals: Arc::clone(&parent.globals),
            universals: Arc::clone(&parent.universals),
            functions: Arc::clone(&parent.functions),
            events: Arc::clone(&parent.events),
            seed,
            scopes: vec![LocalScope {
                kind: ScopeKind::Function,
                vars: HashMap::new(),
            }],
            backtrace: parent.backtrace.clone(),
            job_group: parent.job_group.clone(),
            jobs: Vec::new(),
            owned_fds: Vec::new(),
        }
    }

    /// The script thread that owns this parser.
    #[must_use]
    pub fn tid(&self) -> ScriptThreadId { self.tid }

    /// Resolve a variable: local scopes innermost first, then the branch
    /// seed, then globals, then universals.
    #[must_use]
    pub fn get_var(&self, name: &str) -> Option<VarValue> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.vars.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.seed.get(name) {
            return Some(value.clone());
        }
        self.globals
            .get(name)
            .or_else(|| self.universals.get(name))
    }

    /// Bind a variable in the innermost scope.
    pub fn set_local(&mut self, name: impl Into<String>, value: VarValue) {
        self.scopes
            .last_mut()
            .expect("parser scope stack is never empty")
            .vars
            .insert(name.into(), value);
    }

    /// Set a global variable (visible to every script thread).
    pub fn set_global(&mut self, name: impl Into<String>, value: VarValue) {
        self.globals.set(name, value);
    }

    /// The shared global table.
    #[must_use]
    pub fn globals(&self) -> &Arc<GlobalVars> { &self.globals }

    /// The shared universal table.
    #[must_use]
    pub fn universals(&self) -> &Arc<GlobalVars> { &self.universals }

    /// The shared function table.
    #[must_use]
    pub fn functions(&self) -> &Arc<FunctionTable> { &self.functions }

    /// The shared event handler list.
    #[must_use]
    pub fn events(&self) -> &Arc<EventHandlers> { &self.events }

    /// Open a block scope.
    pub fn push_scope(&mut self, kind: ScopeKind) {
        self.scopes.push(LocalScope {
            kind,
            vars: HashMap::new(),
        });
    }

    /// Close the innermost scope, dropping its bindings.
    ///
    /// # Panics
    ///
    /// Panics on an attempt to pop the base scope.
    pub fn pop_scope(&mut self, kind: ScopeKind) {
        assert!(self.scopes.len() > 1, "attempted to pop the base scope");
        let scope = self.scopes.pop().expect("scope stack checked above");
        assert_eq!(scope.kind, kind, "mismatched scope push/pop");
    }

    /// Push a backtrace frame.
    pub fn push_frame(&mut self, frame: TraceFrame) { self.backtrace.push(frame); }

    /// Pop the innermost backtrace frame.
    pub fn pop_frame(&mut self) -> Option<TraceFrame> { self.backtrace.pop() }

    /// The current backtrace, innermost frame last.
    #[must_use]
    pub fn backtrace(&self) -> &[TraceFrame] { &self.backtrace }

    /// The group this parser's current job runs within.
    #[must_use]
    pub fn job_group(&self) -> Option<&Arc<JobGroup>> { self.job_group.as_ref() }

    /// Enter (or leave, with `None`) a job group context.
    pub fn set_job_group(&mut self, group: Option<Arc<JobGroup>>) {
        self.job_group = group;
    }

    /// Record a job this parser launched.
    pub fn note_job(&mut self, group: Arc<JobGroup>) { self.jobs.push(group); }

    /// Remove a completed (or abandoned) job from the list.
    pub fn retire_job(&mut self, group: &Arc<JobGroup>) {
        self.jobs.retain(|entry| !Arc::ptr_eq(entry, group));
    }

    /// Jobs this parser has launched, oldest first.
    #[must_use]
    pub fn jobs(&self) -> &[Arc<JobGroup>] { &self.jobs }

    /// Take ownership of a descriptor; it is closed when the parser is torn
    /// down.
    pub fn adopt_fd(&mut self, fd: OwnedFd) { self.owned_fds.push(fd); }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::FrameKind;

    fn root() -> Parser {
        Parser::new_root(
            ScriptThreadId(1),
            Arc::new(GlobalVars::new()),
            Arc::new(GlobalVars::new()),
            Arc::new(FunctionTable::new()),
            Arc::new(EventHandlers::new()),
        )
    }

    #[test]
    fn test_local_scoping_shadows_and_unwinds() {
        let mut parser = root();
        parser.set_local("x", vec!["outer".into()]);
        parser.push_scope(ScopeKind::Block);
        parser.set_local("x", vec!["inner".into()]);
        assert_eq!(parser.get_var("x"), Some(vec!["inner".to_string()]));
        parser.pop_scope(ScopeKind::Block);
        assert_eq!(parser.get_var("x"), Some(vec!["outer".to_string()]));
    }

    #[test]
    fn test_branch_seed_reads_through_but_rebinds_locally() {
        let mut parent = root();
        parent.set_local("greeting", vec!["hello".into()]);

        let mut child = Parser::branch_from(&parent, ScriptThreadId(2));
        assert_eq!(child.get_var("greeting"), Some(vec!["hello".to_string()]));

        child.set_local("greeting", vec!["goodbye".into()]);
        assert_eq!(child.get_var("greeting"), Some(vec!["goodbye".to_string()]));
        // The parent never sees the child's rebinding.
        assert_eq!(parent.get_var("greeting"), Some(vec!["hello".to_string()]));
    }

    #[test]
    fn test_inner_scope_wins_in_branch_seed() {
        let mut parent = root();
        parent.set_local("x", vec!["function-level".into()]);
        parent.push_scope(ScopeKind::Block);
        parent.set_local("x", vec!["block-level".into()]);

        let child = Parser::branch_from(&parent, ScriptThreadId(2));
        assert_eq!(child.get_var("x"), Some(vec!["block-level".to_string()]));
    }

    #[test]
    fn test_globals_are_shared_by_reference() {
        let parent = root();
        let mut child = Parser::branch_from(&parent, ScriptThreadId(2));
        child.set_global("foo", vec!["bar".into()]);
        assert_eq!(parent.get_var("foo"), Some(vec!["bar".to_string()]));
    }

    #[test]
    fn test_functions_are_shared_by_reference() {
        let parent = root();
        let child = Parser::branch_from(&parent, ScriptThreadId(2));
        child.functions().define(
            "greet",
            crate::parser::FunctionDef {
                body: "echo hi".into(),
                description: "say hi".into(),
            },
        );
        drop(child);
        assert_eq!(parent.functions().lookup("greet").unwrap().body, "echo hi");
    }

    #[test]
    fn test_job_list_notes_and_retires() {
        let mut parser = root();
        let group = crate::job::JobGroup::resolve(
            None,
            &crate::job::JobProps {
                lone_internal_process: true,
                first_process_internal: true,
                ..crate::job::JobProps::default()
            },
        );
        parser.note_job(Arc::clone(&group));
        assert_eq!(parser.jobs().len(), 1);
        assert!(Arc::ptr_eq(&parser.jobs()[0], &group));
        parser.retire_job(&group);
        assert!(parser.jobs().is_empty());
    }

    #[test]
    fn test_branched_child_starts_with_empty_job_list() {
        let mut parent = root();
        let group = crate::job::JobGroup::resolve(
            None,
            &crate::job::JobProps {
                lone_internal_process: true,
                first_process_internal: true,
                ..crate::job::JobProps::default()
            },
        );
        parent.note_job(group);
        let child = Parser::branch_from(&parent, ScriptThreadId(2));
        assert!(child.jobs().is_empty());
        assert_eq!(parent.jobs().len(), 1);
    }

    #[test]
    fn test_event_handlers_survive_child_teardown() {
        let parent = root();
        let child = Parser::branch_from(&parent, ScriptThreadId(2));
        child.events().register("fish_exit", "cleanup");
        drop(child);
        assert_eq!(parent.events().for_event("fish_exit").len(), 1);
    }

    #[test]
    fn test_backtrace_carried_into_branch() {
        let mut parent = root();
        parent.push_frame(TraceFrame::new(FrameKind::Function, "outer"));
        let child = Parser::branch_from(&parent, ScriptThreadId(2));
        assert_eq!(child.backtrace().len(), 1);
        assert_eq!(child.backtrace()[0].name, "outer");
    }

    #[test]
    #[should_panic(expected = "pop the base scope")]
    fn test_popping_base_scope_panics() {
        let mut parser = root();
        parser.pop_scope(ScopeKind::Function);
    }
}
