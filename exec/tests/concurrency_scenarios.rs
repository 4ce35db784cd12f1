// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios for the concurrent execution core: branched script
//! threads sharing globals, per-thread cwd isolation, pipeline process
//! groups, background jobs, and interrupted waits.
//!
//! Everything here swaps the process-wide working directory on dispatch, so
//! every test is `#[serial]`.

use std::sync::Arc;

use fish_exec::{Executor, FeatureFlag, FunctionDef, JobControlMode, Latch,
                PipelineOutcome, PipelineSpec, ProcSpec, STATUS_WAIT_INTERRUPTED};
use pretty_assertions::assert_eq;
use serial_test::serial;

fn concurrent_executor() -> Arc<Executor> {
    let executor = Executor::new().unwrap();
    executor.features().set(FeatureFlag::Concurrent, true);
    executor.signals().clear();
    executor
}

#[test]
#[serial]
fn test_global_set_in_branch_is_visible_to_parent() {
    let executor = concurrent_executor();
    let parser = executor.root();

    let handle = executor
        .branch(&parser, "set -g foo bar", |child, _exec| {
            child.set_global("foo", vec!["bar".into()]);
            0
        })
        .unwrap();

    let status = executor.wait_branch(&parser, &handle);
    assert_eq!(status, 0);
    assert_eq!(executor.status(), 0);
    assert_eq!(parser.get_var("foo"), Some(vec!["bar".to_string()]));

    executor.finish_root(parser);
}

#[test]
#[serial]
fn test_branch_locals_seed_but_do_not_escape() {
    let executor = concurrent_executor();
    let mut parser = executor.root();
    parser.set_local("x", vec!["parent".into()]);

    let handle = executor
        .branch(&parser, "subshell", |child, _exec| {
            // Reads through to the parent's local...
            assert_eq!(child.get_var("x"), Some(vec!["parent".to_string()]));
            // ...but writing rebinds locally.
            child.set_local("x", vec!["child".into()]);
            0
        })
        .unwrap();
    executor.wait_branch(&parser, &handle);

    assert_eq!(parser.get_var("x"), Some(vec!["parent".to_string()]));
    executor.finish_root(parser);
}

#[test]
#[serial]
fn test_function_defined_in_branch_is_shared() {
    let executor = concurrent_executor();
    let parser = executor.root();

    let handle = executor
        .branch(&parser, "function greet", |child, _exec| {
            child.functions().define(
                "greet",
                FunctionDef {
                    body: "echo hi".into(),
                    description: "say hi".into(),
                },
            );
            0
        })
        .unwrap();
    executor.wait_branch(&parser, &handle);

    // The table is shared by reference, so the definition outlives the
    // branched parser.
    assert_eq!(parser.functions().lookup("greet").unwrap().body, "echo hi");
    assert_eq!(executor.functions().lookup("greet").unwrap().description, "say hi");

    executor.finish_root(parser);
}

#[test]
#[serial]
fn test_branch_starts_with_status_zero() {
    let executor = concurrent_executor();
    let parser = executor.root();
    executor.set_status(42);

    let handle = executor
        .branch(&parser, "status probe", |_child, exec| {
            // Not the parent's 42.
            exec.status()
        })
        .unwrap();

    let status = executor.wait_branch(&parser, &handle);
    assert_eq!(status, 0);
    executor.finish_root(parser);
}

/// For each of three directories, a branched thread `cd`s into it and counts
/// its `*.txt` entries into a shared global list. The parent's cwd is
/// untouched throughout.
#[test]
#[serial]
fn test_branches_accumulate_counts_from_their_own_directories() {
    let executor = concurrent_executor();
    let parser = executor.root();
    let original_pwd = executor.pwd();

    let base = tempfile::tempdir().unwrap();
    for (name, files) in [("a", 1), ("b", 2), ("c", 3)] {
        let dir = base.path().join(name);
        std::fs::create_dir(&dir).unwrap();
        for index in 0..files {
            std::fs::write(dir.join(format!("{index}.txt")), "x").unwrap();
        }
        // One decoy that must not be counted.
        std::fs::write(dir.join("notes.md"), "x").unwrap();
    }

    let mut handles = vec![];
    for name in ["a", "b", "c"] {
        let dir = base.path().join(name);
        let handle = executor
            .branch(&parser, format!("count {name}"), move |child, exec| {
                exec.cd(&dir).unwrap();
                // Relative reads resolve in this thread's directory because
                // the process cwd follows the scheduled thread.
                let count = std::fs::read_dir(".")
                    .unwrap()
                    .filter_map(Result::ok)
                    .filter(|entry| {
                        entry.path().extension().is_some_and(|ext| ext == "txt")
                    })
                    .count();
                child.globals().append("counts", count.to_string());
                0
            })
            .unwrap();
        handles.push(handle);
    }
    for handle in &handles {
        executor.wait_branch(&parser, handle);
    }

    let mut counts = parser.get_var("counts").unwrap();
    counts.sort();
    assert_eq!(counts, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
    assert_eq!(executor.pwd(), original_pwd);
    assert_eq!(std::env::current_dir().unwrap(), original_pwd);

    executor.finish_root(parser);
}

/// Ten threads each `cd` into their own directory, write two files, and
/// count entries. Every directory ends up with exactly two files and the
/// parent's `$PWD` is unchanged.
#[test]
#[serial]
fn test_concurrent_cd_isolation_across_ten_threads() {
    let executor = concurrent_executor();
    let parser = executor.root();
    let original_pwd = executor.pwd();

    let base = tempfile::tempdir().unwrap();
    let mut handles = vec![];
    for index in 0..10 {
        let dir = base.path().join(format!("worker-{index}"));
        std::fs::create_dir(&dir).unwrap();
        let handle = executor
            .branch(&parser, format!("worker {index}"), move |child, exec| {
                exec.cd(&dir).unwrap();
                std::fs::write("one", "1").unwrap();
                // Hand the turn around between the two writes to force
                // interleaving with the other nine workers.
                exec.yield_now(child);
                std::fs::write("two", "2").unwrap();
                let entries = std::fs::read_dir(".").unwrap().count();
                child.globals().append("entry-counts", entries.to_string());
                0
            })
            .unwrap();
        handles.push(handle);
    }
    for handle in &handles {
        assert_eq!(executor.wait_branch(&parser, handle), 0);
    }

    let counts = parser.get_var("entry-counts").unwrap();
    assert_eq!(counts.len(), 10);
    assert!(counts.iter().all(|count| count == "2"));
    for index in 0..10 {
        let dir = base.path().join(format!("worker-{index}"));
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 2);
    }
    assert_eq!(executor.pwd(), original_pwd);

    executor.finish_root(parser);
}

/// With job control forced on, all stages of an internal pipeline observe
/// the same pgid (held open by the forked owner).
#[test]
#[serial]
fn test_internal_pipeline_stages_share_one_pgid() {
    let executor = concurrent_executor();
    executor.set_job_control_mode(JobControlMode::Full);
    let mut parser = executor.root();

    let mut spec = PipelineSpec::new("print_pgrp | print_pgrp | print_pgrp");
    for index in 0..3 {
        spec = spec.stage(ProcSpec::internal(format!("print_pgrp {index}"), |child, _exec, _io| {
            let pgid = child
                .job_group()
                .expect("stage runs inside a job group")
                .pgid()
                .expect("job-control full pipelines have a pgid");
            child.globals().append("pgids", pgid.as_raw().to_string());
            0
        }));
    }

    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    assert!(matches!(outcome, PipelineOutcome::Completed(0)));

    let pgids = parser.get_var("pgids").unwrap();
    assert_eq!(pgids.len(), 3);
    assert!(pgids.iter().all(|pgid| pgid == &pgids[0]));
    // The owner is a forked child, not the shell itself.
    assert_ne!(pgids[0], nix::unistd::getpgrp().as_raw().to_string());

    executor.finish_root(parser);
}

/// A backgrounded pipeline that itself backgrounds another pipeline:
/// the two jobs run in different process groups.
#[test]
#[serial]
fn test_background_subjobs_get_distinct_pgids() {
    let executor = concurrent_executor();
    executor.set_job_control_mode(JobControlMode::Full);
    let mut parser = executor.root();

    let inner_exec = Arc::clone(&executor);
    let outer = PipelineSpec::new("outer &")
        .stage(ProcSpec::internal("outer stage 0", move |child, _exec, _io| {
            let own_pgid = child.job_group().unwrap().pgid().unwrap();
            child.globals().append("outer-pgid", own_pgid.as_raw().to_string());

            let inner = PipelineSpec::new("inner &")
                .stage(ProcSpec::internal("inner stage 0", |child, _exec, _io| {
                    let pgid = child.job_group().unwrap().pgid().unwrap();
                    child.globals().append("inner-pgid", pgid.as_raw().to_string());
                    0
                }))
                .stage(ProcSpec::internal("inner stage 1", |_child, _exec, _io| 0))
                .background();
            let outcome = inner_exec.run_pipeline(child, inner).unwrap();
            assert!(matches!(outcome, PipelineOutcome::Backgrounded(_)));
            0
        }))
        .stage(ProcSpec::internal("outer stage 1", |_child, _exec, _io| 0))
        .background();

    let outcome = executor.run_pipeline(&mut parser, outer).unwrap();
    assert!(matches!(outcome, PipelineOutcome::Backgrounded(_)));

    // `wait` drains both jobs (the inner one was registered by the stage).
    let status = executor.wait_all_jobs(&parser);
    assert_eq!(status, 0);

    let outer_pgid = parser.get_var("outer-pgid").unwrap();
    let inner_pgid = parser.get_var("inner-pgid").unwrap();
    assert_ne!(outer_pgid[0], inner_pgid[0]);

    executor.finish_root(parser);
}

/// Data flows between script-thread stages through real pipes.
#[test]
#[serial]
fn test_internal_pipeline_dataflow() {
    let executor = concurrent_executor();
    let mut parser = executor.root();

    let spec = PipelineSpec::new("producer | consumer")
        .stage(ProcSpec::internal("producer", |child, exec, mut io| {
            let out = io.stdout.take().expect("producer has a pipe");
            exec.write_blocking(child.tid(), &out, b"hello from stage 0")
                .unwrap();
            0
        }))
        .stage(ProcSpec::internal("consumer", |child, exec, mut io| {
            let input = io.stdin.take().expect("consumer has a pipe");
            let bytes = exec.read_all_blocking(child.tid(), &input).unwrap();
            child
                .globals()
                .set("received", vec![String::from_utf8(bytes).unwrap()]);
            7
        }));

    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    assert!(matches!(outcome, PipelineOutcome::Completed(7)));
    assert_eq!(executor.status(), 7);
    assert_eq!(executor.statuses().pipestatus.as_slice(), &[0, 7]);
    assert_eq!(
        parser.get_var("received"),
        Some(vec!["hello from stage 0".to_string()])
    );
    // Foreground jobs are retired from the parser's job list on completion.
    assert!(parser.jobs().is_empty());

    executor.finish_root(parser);
}

/// With the `concurrent` flag off the same pipeline runs single-threaded
/// through buffered plumbing.
#[test]
#[serial]
fn test_sequential_pipeline_when_concurrent_is_off() {
    let executor = Executor::new().unwrap();
    executor.signals().clear();
    let mut parser = executor.root();

    assert!(executor
        .branch(&parser, "must fail", |_child, _exec| 0)
        .is_err());

    let spec = PipelineSpec::new("producer | consumer")
        .stage(ProcSpec::internal("producer", |child, exec, mut io| {
            let out = io.stdout.take().unwrap();
            exec.write_blocking(child.tid(), &out, b"buffered bytes").unwrap();
            0
        }))
        .stage(ProcSpec::internal("consumer", |child, exec, mut io| {
            let input = io.stdin.take().unwrap();
            let bytes = exec.read_all_blocking(child.tid(), &input).unwrap();
            child
                .globals()
                .set("received", vec![String::from_utf8(bytes).unwrap()]);
            0
        }));

    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    assert!(matches!(outcome, PipelineOutcome::Completed(0)));
    assert_eq!(
        parser.get_var("received"),
        Some(vec!["buffered bytes".to_string()])
    );

    executor.finish_root(parser);
}

/// External stages: exit statuses propagate, and an external producer can
/// feed a script-thread consumer.
#[test]
#[serial]
fn test_external_stages_and_mixed_pipeline() {
    let executor = concurrent_executor();
    let mut parser = executor.root();

    let ok = PipelineSpec::new("true").stage(ProcSpec::external(["true"]));
    assert!(matches!(
        executor.run_pipeline(&mut parser, ok).unwrap(),
        PipelineOutcome::Completed(0)
    ));

    let fail = PipelineSpec::new("false").stage(ProcSpec::external(["false"]));
    assert!(matches!(
        executor.run_pipeline(&mut parser, fail).unwrap(),
        PipelineOutcome::Completed(1)
    ));

    let mixed = PipelineSpec::new("echo hi | consumer")
        .stage(ProcSpec::external(["echo", "hi"]))
        .stage(ProcSpec::internal("consumer", |child, exec, mut io| {
            let input = io.stdin.take().unwrap();
            let bytes = exec.read_all_blocking(child.tid(), &input).unwrap();
            child
                .globals()
                .set("echoed", vec![String::from_utf8_lossy(&bytes).into_owned()]);
            0
        }));
    assert!(matches!(
        executor.run_pipeline(&mut parser, mixed).unwrap(),
        PipelineOutcome::Completed(0)
    ));
    assert_eq!(
        parser.get_var("echoed"),
        Some(vec!["hi\n".to_string()])
    );

    executor.finish_root(parser);
}

/// `jobs` lists a running background job with its id; `wait` retires it.
#[test]
#[serial]
fn test_jobs_snapshot_and_wait_retire() {
    let executor = concurrent_executor();
    let mut parser = executor.root();

    let gate = Arc::new(Latch::new());
    let stage_gate = Arc::clone(&gate);
    let spec = PipelineSpec::new("sleepy &")
        .stage(ProcSpec::internal("sleepy", move |child, exec, _io| {
            exec.unlocked(child.tid(), || {
                let _: () = stage_gate.wait();
            });
            5
        }))
        .background();

    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    let PipelineOutcome::Backgrounded(job) = outcome else {
        panic!("expected a backgrounded job");
    };
    assert_eq!(executor.status(), 0);

    let snapshot = executor.jobs_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].job_id.is_some());
    assert_eq!(snapshot[0].desc, "sleepy &");
    assert_eq!(snapshot[0].state, fish_exec::JobState::Running);
    // The launching parser also holds the job's group handle.
    assert_eq!(parser.jobs().len(), 1);
    assert!(Arc::ptr_eq(&parser.jobs()[0], job.group()));

    gate.set(());
    let status = executor.wait_job(&parser, &job);
    assert_eq!(status, 5);
    assert_eq!(executor.status(), 5);
    assert!(executor.jobs_snapshot().is_empty());

    executor.finish_root(parser);
}

/// An interrupted `wait` reports 124, leaves the job running, and a later
/// `wait` still collects it.
#[test]
#[serial]
fn test_interrupted_wait_reports_124_and_job_survives() {
    let executor = concurrent_executor();
    let parser = executor.root();

    let gate: Arc<Latch<()>> = Arc::new(Latch::new());
    let child_gate = Arc::clone(&gate);
    let handle = executor
        .branch(&parser, "long runner", move |child, exec| {
            exec.unlocked(child.tid(), || {
                let _: () = child_gate.wait();
            });
            9
        })
        .unwrap();

    executor.signals().request_cancel();
    let status = executor.wait_branch(&parser, &handle);
    assert_eq!(status, STATUS_WAIT_INTERRUPTED);
    assert_eq!(executor.status(), STATUS_WAIT_INTERRUPTED);
    // The interrupt was consumed and the child is still alive.
    assert!(!executor.signals().cancel_requested());
    assert!(!handle.is_finished());

    gate.set(());
    let status = executor.wait_branch(&parser, &handle);
    assert_eq!(status, 9);

    executor.finish_root(parser);
}

/// An interrupt delivered while a three-stage internal pipeline spins makes
/// every stage unwind at its next suspension point; afterwards `jobs`
/// reports nothing.
#[test]
#[serial]
fn test_interrupt_unwinds_internal_pipeline() {
    let executor = concurrent_executor();
    executor.set_job_control_mode(JobControlMode::Full);
    let mut parser = executor.root();

    let mut spec = PipelineSpec::new("forever | forever | forever");
    for index in 0..3 {
        spec = spec.stage(ProcSpec::internal(format!("forever {index}"), |child, exec, _io| {
            loop {
                if exec.signals().cancel_requested() {
                    return exec.signals().interrupt_status();
                }
                exec.yield_now(child);
            }
        }));
    }

    // Deliver the interrupt from outside the cooperative world.
    let signals = executor.signals();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        signals.request_cancel();
    });

    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    interrupter.join().unwrap();

    let PipelineOutcome::Completed(status) = outcome else {
        panic!("foreground pipeline must complete");
    };
    assert_eq!(status, 130);
    assert_eq!(executor.statuses().pipestatus.as_slice(), &[130, 130, 130]);
    // The interrupt was consumed by the foreground wait.
    assert!(!executor.signals().cancel_requested());
    assert!(executor.jobs_snapshot().is_empty());

    executor.finish_root(parser);
}

/// A signalled background job surfaces in `jobs` state and, via `wait`, in
/// `$status` as 128+N.
#[test]
#[serial]
fn test_signalled_background_job_surfaces_in_wait() {
    let executor = concurrent_executor();
    executor.set_job_control_mode(JobControlMode::Full);
    let mut parser = executor.root();

    let spec = PipelineSpec::new("sleep 30 &")
        .stage(ProcSpec::external(["sleep", "30"]))
        .background();
    let outcome = executor.run_pipeline(&mut parser, spec).unwrap();
    let PipelineOutcome::Backgrounded(job) = outcome else {
        panic!("expected a backgrounded job");
    };
    assert_eq!(job.state(), fish_exec::JobState::Running);
    assert!(job.group().pgid().is_some());

    job.group()
        .signal(nix::sys::signal::Signal::SIGTERM)
        .unwrap();

    let status = executor.wait_job(&parser, &job);
    assert_eq!(status, 128 + 15);
    assert!(executor.jobs_snapshot().is_empty());

    executor.finish_root(parser);
}

/// FIFO fairness across branched threads: the order in which they first run
/// matches the order in which they queued.
#[test]
#[serial]
fn test_branches_are_scheduled_fifo() {
    let executor = concurrent_executor();
    let parser = executor.root();

    let mut handles = vec![];
    for index in 0..5 {
        let handle = executor
            .branch(&parser, format!("fifo {index}"), move |child, _exec| {
                child.globals().append("order", index.to_string());
                0
            })
            .unwrap();
        // The child enqueues as soon as its OS thread starts; wait for that
        // so enqueue order is deterministic.
        while !executor.gil().is_queued(handle.tid()) {
            std::thread::yield_now();
        }
        handles.push(handle);
    }

    for handle in &handles {
        executor.wait_branch(&parser, handle);
    }
    assert_eq!(
        parser.get_var("order").unwrap(),
        vec!["0", "1", "2", "3", "4"]
    );

    executor.finish_root(parser);
}
