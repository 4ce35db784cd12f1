// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Variable storage shared across script threads.
//!
//! Shell variables are lists of strings. Global (and universal) tables are
//! shared by reference between every parser; the interpreter lock is what
//! keeps access race-free in script semantics, the mutex below only makes
//! that safety visible to the compiler. Local scopes live on each
//! [`Parser`](super::Parser) and are never shared.

use std::{collections::HashMap,
          sync::Mutex};

/// A shell variable's value: a list of strings.
pub type VarValue = Vec<String>;

/// A shared, reference-semantics variable table (globals, universals).
///
/// Mutations are visible to every script thread the moment they are next
/// scheduled.
#[derive(Debug, Default)]
pub struct GlobalVars {
    table: Mutex<HashMap<String, VarValue>>,
}

impl GlobalVars {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Look up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<VarValue> {
        self.lock_table().get(name).cloned()
    }

    /// Set (or overwrite) a variable.
    pub fn set(&self, name: impl Into<String>, value: VarValue) {
        self.lock_table().insert(name.into(), value);
    }

    /// Append one element to a list variable, creating it if absent.
    pub fn append(&self, name: &str, element: impl Into<String>) {
        self.lock_table()
            .entry(name.to_string())
            .or_default()
            .push(element.into());
    }

    /// Erase a variable. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool { self.lock_table().remove(name).is_some() }

    /// Names of all variables, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> { self.lock_table().keys().cloned().collect() }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, VarValue>> {
        self.table.lock().expect("variable table poisoned")
    }
}

/// One shell function: body source plus metadata. The interpreter front end
/// owns parsing and calling; this crate only stores and shares definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    /// The function body, as source text.
    pub body: String,
    /// Description shown by function listings.
    pub description: String,
}

/// The process-global function table, shared by reference between every
/// parser.
///
/// A function defined by any script thread is callable from every other
/// thread the moment it is next scheduled; a branched parser's definitions
/// outlive it.
#[derive(Debug, Default)]
pub struct FunctionTable {
    table: Mutex<HashMap<String, FunctionDef>>,
}

impl FunctionTable {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Define (or redefine) a function.
    pub fn define(&self, name: impl Into<String>, def: FunctionDef) {
        self.lock_table().insert(name.into(), def);
    }

    /// Look up a function definition.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<FunctionDef> {
        self.lock_table().get(name).cloned()
    }

    /// Erase a function. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool { self.lock_table().remove(name).is_some() }

    /// Names of all defined functions, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> { self.lock_table().keys().cloned().collect() }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, FunctionDef>> {
        self.table.lock().expect("function table poisoned")
    }
}

/// A registered event handler: when `event` fires, call `function`.
///
/// The list is process-global and shared by reference; handlers registered by
/// a branched parser outlive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandler {
    pub event: String,
    pub function: String,
}

/// The process-global event handler list.
#[derive(Debug, Default)]
pub struct EventHandlers {
    handlers: Mutex<Vec<EventHandler>>,
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, event: impl Into<String>, function: impl Into<String>) {
        self.handlers
            .lock()
            .expect("event handler list poisoned")
            .push(EventHandler {
                event: event.into(),
                function: function.into(),
            });
    }

    /// Handlers registered for the given event.
    #[must_use]
    pub fn for_event(&self, event: &str) -> Vec<EventHandler> {
        self.handlers
            .lock()
            .expect("event handler list poisoned")
            .iter()
            .filter(|handler| handler.event == event)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().expect("event handler list poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
