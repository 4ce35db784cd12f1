// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The interpreter lock and its run queue.
//!
//! At most one script thread executes shell script at any instant. Threads
//! that want a turn enqueue themselves FIFO and sleep on a private condition
//! variable; the releasing thread wakes exactly the thread whose turn is
//! next. There are no priorities and no preemption: a running thread keeps
//! the lock until it calls [`Gil::release`] or [`Gil::yield_now`].
//!
//! Blocking syscalls never happen while holding the lock. The pattern is
//! [`Gil::unlocked`]: give up the turn, perform the syscall, queue up for the
//! next turn. Between those two points another script thread may run and
//! mutate shared state.
//!
//! Misuse (releasing a lock one does not own, destroying a live thread) is a
//! scheduling-invariant violation and panics; there is no error path out of
//! the scheduler itself.

use std::{collections::{HashMap, VecDeque},
          sync::{Arc, Condvar, Mutex,
                 atomic::{AtomicU64, Ordering}}};

use super::{ScriptThreadId, SchedulerObserver};

/// Wait state of one registered script thread: the private condition
/// variable it sleeps on while queued.
#[derive(Debug, Default)]
struct WaitSlot {
    wakeup: Condvar,
}

/// Mutable scheduler state, all behind one mutex.
#[derive(Debug, Default)]
struct GilState {
    /// The thread currently executing script, if any.
    owner: Option<ScriptThreadId>,
    /// Threads waiting for a turn, front is next.
    waitqueue: VecDeque<ScriptThreadId>,
    /// Every registered (spawned, not yet destroyed) thread.
    threads: HashMap<ScriptThreadId, Arc<WaitSlot>>,
}

/// The global interpreter lock: scheduler, run queue, and observer registry.
///
/// Own one of these per process (the executor wraps it in an [`Arc`]); script
/// threads interact with it through their [`ScriptThreadId`].
#[allow(missing_debug_implementations)]
#[derive(Default)]
pub struct Gil {
    state: Mutex<GilState>,
    observers: Mutex<Vec<Arc<dyn SchedulerObserver>>>,
    next_id: AtomicU64,
}

impl Gil {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register an observer. Must happen before scheduling begins; hooks are
    /// not fired retroactively for threads that already exist.
    pub fn register_observer(&self, observer: Arc<dyn SchedulerObserver>) {
        self.observers
            .lock()
            .expect("gil observer list poisoned")
            .push(observer);
    }

    /// Register a new script thread and fire `did_spawn`.
    ///
    /// The caller must be the current owner (or be bootstrapping the very
    /// first thread while nothing is scheduled): observers snapshot the
    /// currently published live state as the new thread's initial state.
    /// Does not schedule the new thread.
    pub fn spawn(&self) -> ScriptThreadId {
        let tid = ScriptThreadId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        {
            let mut state = self.lock_state();
            let previous = state.threads.insert(tid, Arc::new(WaitSlot::default()));
            assert!(previous.is_none(), "{tid} spawned twice");
        }
        tracing::trace!("{tid} spawned");
        self.fire(|observer| observer.did_spawn(tid));
        tid
    }

    /// Queue up for a turn and block until scheduled. On return the caller
    /// owns the lock and `did_schedule` has fired.
    ///
    /// # Panics
    ///
    /// Panics if the thread is unknown, already the owner, or already queued.
    pub fn run(&self, tid: ScriptThreadId) {
        let mut state = self.lock_state();
        assert!(state.threads.contains_key(&tid), "{tid} is not registered");
        assert!(state.owner != Some(tid), "{tid} ran while already scheduled");
        assert!(
            !state.waitqueue.contains(&tid),
            "{tid} ran while already queued"
        );

        state.waitqueue.push_back(tid);
        let slot = Arc::clone(&state.threads[&tid]);
        loop {
            if state.owner.is_none() && state.waitqueue.front() == Some(&tid) {
                state.waitqueue.pop_front();
                state.owner = Some(tid);
                break;
            }
            state = slot.wakeup.wait(state).expect("gil state poisoned");
        }
        drop(state);

        tracing::trace!("{tid} scheduled");
        self.fire(|observer| observer.did_schedule(tid));
    }

    /// Give up the lock: fire `will_unschedule`, clear the owner, and wake
    /// the next queued thread (if any).
    ///
    /// # Panics
    ///
    /// Panics if the caller does not own the lock.
    pub fn release(&self, tid: ScriptThreadId) {
        {
            let state = self.lock_state();
            assert!(
                state.owner == Some(tid),
                "{tid} released the lock without owning it"
            );
        }
        self.fire(|observer| observer.will_unschedule(tid));

        let mut state = self.lock_state();
        state.owner = None;
        if let Some(next) = state.waitqueue.front() {
            state.threads[next].wakeup.notify_one();
        }
        drop(state);
        tracing::trace!("{tid} released");
    }

    /// Cooperative yield: release then immediately queue up again. Goes to
    /// the back of the queue, so this is not a no-op when other threads are
    /// waiting.
    pub fn yield_now(&self, tid: ScriptThreadId) {
        self.release(tid);
        self.run(tid);
    }

    /// Release the lock around a blocking operation and reacquire afterward.
    ///
    /// While inside `blocking_work` the caller holds no scheduler state at
    /// all and other script threads run freely.
    pub fn unlocked<R>(&self, tid: ScriptThreadId, blocking_work: impl FnOnce() -> R) -> R {
        self.release(tid);
        let result = blocking_work();
        self.run(tid);
        result
    }

    /// Deregister a thread and fire `will_destroy`.
    ///
    /// # Panics
    ///
    /// Panics if the thread is still the owner or still queued.
    pub fn destroy(&self, tid: ScriptThreadId) {
        {
            let mut state = self.lock_state();
            assert!(state.owner != Some(tid), "{tid} destroyed while scheduled");
            assert!(
                !state.waitqueue.contains(&tid),
                "{tid} destroyed while queued"
            );
            let removed = state.threads.remove(&tid);
            assert!(removed.is_some(), "{tid} destroyed twice");
        }
        self.fire(|observer| observer.will_destroy(tid));
        tracing::trace!("{tid} destroyed");
    }

    /// Does the given thread currently own the lock?
    #[must_use]
    pub fn is_scheduled(&self, tid: ScriptThreadId) -> bool {
        self.lock_state().owner == Some(tid)
    }

    /// Is the given thread currently waiting in the run queue?
    #[must_use]
    pub fn is_queued(&self, tid: ScriptThreadId) -> bool {
        self.lock_state().waitqueue.contains(&tid)
    }

    /// Number of registered (spawned, not destroyed) script threads.
    #[must_use]
    pub fn thread_count(&self) -> usize { self.lock_state().threads.len() }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GilState> {
        self.state.lock().expect("gil state poisoned")
    }

    fn fire(&self, hook: impl Fn(&dyn SchedulerObserver)) {
        let observers = self
            .observers
            .lock()
            .expect("gil observer list poisoned")
            .clone();
        for observer in &observers {
            hook(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::{Arc, Mutex,
                     atomic::{AtomicBool, Ordering}},
              thread,
              time::Duration};

    use super::*;

    #[test]
    fn test_single_thread_run_release_round_trip() {
        let gil = Gil::new();
        let tid = gil.spawn();
        gil.run(tid);
        assert!(gil.is_scheduled(tid));
        gil.release(tid);
        assert!(!gil.is_scheduled(tid));
        gil.destroy(tid);
        assert_eq!(gil.thread_count(), 0);
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let gil = Arc::new(Gil::new());
        let busy = Arc::new(AtomicBool::new(false));

        let mut handles = vec![];
        for _ in 0..8 {
            let gil = Arc::clone(&gil);
            let busy = Arc::clone(&busy);
            let tid = gil.spawn();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    gil.run(tid);
                    // If two threads were ever scheduled at once, one of them
                    // would observe `busy` already set.
                    assert!(!busy.swap(true, Ordering::SeqCst));
                    thread::sleep(Duration::from_micros(50));
                    busy.store(false, Ordering::SeqCst);
                    gil.release(tid);
                }
                gil.destroy(tid);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_fifo_order_of_waiters() {
        let gil = Arc::new(Gil::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lock so every worker queues behind the gate.
        let gate = gil.spawn();
        gil.run(gate);

        let mut expected = vec![];
        let mut handles = vec![];
        for _ in 0..5 {
            let tid = gil.spawn();
            expected.push(tid);
            let worker_gil = Arc::clone(&gil);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                worker_gil.run(tid);
                order.lock().unwrap().push(tid);
                worker_gil.release(tid);
                worker_gil.destroy(tid);
            }));
            // Give the worker time to enqueue before spawning the next, so
            // the enqueue order is deterministic.
            while !gil.is_queued(tid) {
                thread::yield_now();
            }
        }

        gil.release(gate);
        for handle in handles {
            handle.join().unwrap();
        }
        gil.destroy(gate);

        assert_eq!(*order.lock().unwrap(), expected);
    }

    #[test]
    fn test_yield_rotates_to_back_of_queue() {
        let gil = Arc::new(Gil::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = gil.spawn();
        gil.run(first);

        let second = gil.spawn();
        let worker = {
            let gil = Arc::clone(&gil);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                gil.run(second);
                order.lock().unwrap().push("second");
                gil.release(second);
                gil.destroy(second);
            })
        };
        while !gil.is_queued(second) {
            thread::yield_now();
        }

        // Yielding with a nonempty queue hands the turn over.
        gil.yield_now(first);
        order.lock().unwrap().push("first-back");
        gil.release(first);
        gil.destroy(first);
        worker.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["second", "first-back"]);
    }

    #[test]
    #[should_panic(expected = "released the lock without owning it")]
    fn test_release_without_ownership_panics() {
        let gil = Gil::new();
        let tid = gil.spawn();
        gil.release(tid);
    }

    /// Observer that records the hook sequence, for ordering assertions.
    struct RecordingObserver {
        events: Arc<Mutex<Vec<(String, ScriptThreadId)>>>,
    }

    impl SchedulerObserver for RecordingObserver {
        fn did_spawn(&self, tid: ScriptThreadId) {
            self.events.lock().unwrap().push(("spawn".into(), tid));
        }
        fn will_unschedule(&self, tid: ScriptThreadId) {
            self.events.lock().unwrap().push(("unschedule".into(), tid));
        }
        fn did_schedule(&self, tid: ScriptThreadId) {
            self.events.lock().unwrap().push(("schedule".into(), tid));
        }
        fn will_destroy(&self, tid: ScriptThreadId) {
            self.events.lock().unwrap().push(("destroy".into(), tid));
        }
    }

    #[test]
    fn test_unschedule_of_a_precedes_schedule_of_b() {
        let gil = Arc::new(Gil::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        gil.register_observer(Arc::new(RecordingObserver {
            events: Arc::clone(&events),
        }));

        let a = gil.spawn();
        gil.run(a);

        let b = gil.spawn();
        let worker = {
            let gil = Arc::clone(&gil);
            thread::spawn(move || {
                gil.run(b);
                gil.release(b);
                gil.destroy(b);
            })
        };
        while !gil.is_queued(b) {
            thread::yield_now();
        }
        gil.release(a);
        worker.join().unwrap();
        gil.destroy(a);

        let events = events.lock().unwrap();
        let unschedule_a = events
            .iter()
            .position(|e| *e == ("unschedule".to_string(), a))
            .unwrap();
        let schedule_b = events
            .iter()
            .position(|e| *e == ("schedule".to_string(), b))
            .unwrap();
        assert!(unschedule_a < schedule_b);
        // Exactly one spawn and one destroy per thread.
        for tid in [a, b] {
            assert_eq!(
                events
                    .iter()
                    .filter(|e| **e == ("spawn".to_string(), tid))
                    .count(),
                1
            );
            assert_eq!(
                events
                    .iter()
                    .filter(|e| **e == ("destroy".to_string(), tid))
                    .count(),
                1
            );
        }
    }
}
