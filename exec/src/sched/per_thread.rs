// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-script-thread variables.
//!
//! A [`PerThreadVar`] looks like one process-wide value, but once registered
//! as a scheduler observer it keeps one saved copy per script thread and
//! swaps the live value on every context switch:
//!
//! - `did_spawn`: materialize the new thread's slot from the current live
//!   value (the spawner's view).
//! - `will_unschedule`: save the live value into the outgoing thread's slot.
//! - `did_schedule`: load the incoming thread's slot into the live value.
//! - `will_destroy`: drop the slot.
//!
//! This is what makes `$status`, `$pipestatus`, the cwd, and backtrace state
//! per-thread without touching any of their accessors: accessors only ever
//! read and write the live value.

use std::{collections::HashMap,
          sync::Mutex};

use super::{ScriptThreadId, SchedulerObserver};

/// One logically process-wide value with a saved copy per script thread.
///
/// Accessors ([`get`], [`set`], [`with`]) touch only the live value and must
/// be called from the currently scheduled thread; the observer hooks keep the
/// live value in sync with whoever is scheduled.
///
/// A missing slot inside a hook is a lifecycle bug (a thread being scheduled
/// that was never spawned, or destroyed twice) and panics.
///
/// [`get`]: Self::get
/// [`set`]: Self::set
/// [`with`]: Self::with
#[derive(Debug)]
pub struct PerThreadVar<T: Clone + Send + 'static> {
    /// Identifies the variable in logs and panic messages.
    name: &'static str,
    live: Mutex<T>,
    slots: Mutex<HashMap<ScriptThreadId, T>>,
}

impl<T: Clone + Send + 'static> PerThreadVar<T> {
    #[must_use]
    pub fn new(name: &'static str, initial: T) -> Self {
        Self {
            name,
            live: Mutex::new(initial),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Read the live value.
    #[must_use]
    pub fn get(&self) -> T { self.lock_live().clone() }

    /// Replace the live value.
    pub fn set(&self, value: T) { *self.lock_live() = value; }

    /// Mutate the live value in place.
    pub fn with<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        mutate(&mut self.lock_live())
    }

    /// Overwrite the saved slot of a thread that has been spawned but not yet
    /// scheduled. Used at branch time to seed child state that deliberately
    /// differs from the spawner's snapshot (a child starts with `$status` 0,
    /// not the parent's last status).
    ///
    /// # Panics
    ///
    /// Panics if the thread has no slot.
    pub fn put(&self, tid: ScriptThreadId, value: T) {
        let mut slots = self.lock_slots();
        let slot = slots
            .get_mut(&tid)
            .unwrap_or_else(|| panic!("per-thread var '{}': no slot for {tid}", self.name));
        *slot = value;
    }

    /// Read the saved slot of a thread that is not currently scheduled.
    #[must_use]
    pub fn peek(&self, tid: ScriptThreadId) -> Option<T> {
        self.lock_slots().get(&tid).cloned()
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, T> {
        self.live
            .lock()
            .unwrap_or_else(|_| panic!("per-thread var '{}': live value poisoned", self.name))
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<ScriptThreadId, T>> {
        self.slots
            .lock()
            .unwrap_or_else(|_| panic!("per-thread var '{}': slots poisoned", self.name))
    }
}

impl<T: Clone + Send + 'static> SchedulerObserver for PerThreadVar<T> {
    fn did_spawn(&self, tid: ScriptThreadId) {
        let snapshot = self.get();
        let previous = self.lock_slots().insert(tid, snapshot);
        assert!(
            previous.is_none(),
            "per-thread var '{}': duplicate slot for {tid}",
            self.name
        );
    }

    fn will_unschedule(&self, tid: ScriptThreadId) {
        let live = self.get();
        self.put(tid, live);
    }

    fn did_schedule(&self, tid: ScriptThreadId) {
        let saved = self
            .peek(tid)
            .unwrap_or_else(|| panic!("per-thread var '{}': no slot for {tid}", self.name));
        self.set(saved);
    }

    fn will_destroy(&self, tid: ScriptThreadId) {
        let removed = self.lock_slots().remove(&tid);
        assert!(
            removed.is_some(),
            "per-thread var '{}': destroying {tid} which has no slot",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sched::Gil;

    #[test]
    fn test_hooks_swap_values_between_threads() {
        let var = PerThreadVar::new("probe", 0);
        let a = ScriptThreadId(1);
        let b = ScriptThreadId(2);

        var.did_spawn(a);
        var.did_spawn(b);

        var.did_schedule(a);
        var.set(10);
        var.will_unschedule(a);

        var.did_schedule(b);
        assert_eq!(var.get(), 0); // B's snapshot, not A's write.
        var.set(20);
        var.will_unschedule(b);

        var.did_schedule(a);
        assert_eq!(var.get(), 10);
        var.will_unschedule(a);

        var.will_destroy(a);
        var.will_destroy(b);
        assert_eq!(var.peek(a), None);
    }

    #[test]
    fn test_spawn_snapshots_current_live_value() {
        let var = PerThreadVar::new("probe", "root".to_string());
        let child = ScriptThreadId(9);
        var.set("parent-view".to_string());
        var.did_spawn(child);
        assert_eq!(var.peek(child).unwrap(), "parent-view");
    }

    #[test]
    #[should_panic(expected = "no slot for")]
    fn test_scheduling_unknown_thread_panics() {
        let var: PerThreadVar<i32> = PerThreadVar::new("probe", 0);
        var.did_schedule(ScriptThreadId(42));
    }

    #[test]
    fn test_registered_with_gil_isolates_writes_per_thread() {
        let gil = Arc::new(Gil::new());
        let var = Arc::new(PerThreadVar::new("probe", 0_i64));
        gil.register_observer(Arc::clone(&var) as Arc<dyn SchedulerObserver>);

        let root = gil.spawn();
        gil.run(root);
        var.set(-1);

        let mut handles = vec![];
        for i in 1..=4 {
            let tid = gil.spawn();
            let gil = Arc::clone(&gil);
            let var = Arc::clone(&var);
            handles.push(thread::spawn(move || {
                gil.run(tid);
                var.set(i);
                gil.yield_now(tid);
                // Still this thread's value after losing and regaining the
                // lock any number of times.
                assert_eq!(var.get(), i);
                gil.release(tid);
                gil.destroy(tid);
            }));
        }

        gil.release(root);
        for handle in handles {
            handle.join().unwrap();
        }
        gil.run(root);
        assert_eq!(var.get(), -1);
        gil.release(root);
        gil.destroy(root);
    }
}
