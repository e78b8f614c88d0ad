//! Final-sweep tests: parallel trials, merge, report writing and failure handling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use dgemm_tune::error::{build_failed, Result};
use dgemm_tune::{
    BenchRequest, BuildSpec, Orchestrator, Report, SizeRange, StaggerPolicy, SweepPlan,
    TrialExecutor, TuneError,
};

fn plan(trial_count: usize, report_path: PathBuf) -> SweepPlan {
    SweepPlan {
        unroll: 8,
        block_size: 96,
        trial_count,
        request: BenchRequest::new(
            ["simple", "avx256_unroll_blocking"],
            SizeRange::new(64, 192, 64).unwrap(),
            false,
        ),
        report_path,
    }
}

/// Every requested row at one throughput, with `ms = 2 * gflops`.
fn kernel_output(request: &BenchRequest, gflops: f64) -> String {
    let mut out = String::new();
    for algorithm in &request.algorithms {
        for size in request.size_range.sizes() {
            out.push_str(&format!("{algorithm},{size},{:.0},{gflops:.2}\n", 2.0 * gflops));
        }
    }
    out
}

#[test]
fn test_trials_are_averaged_into_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("reports").join("report.csv");
    let runs = AtomicUsize::new(0);

    let executor = TrialExecutor::new(
        |spec: &BuildSpec| -> Result<()> {
            assert_eq!((spec.unroll, spec.block_size), (8, 96));
            Ok(())
        },
        |_: &Path, request: &BenchRequest| -> Result<String> {
            // Trials report 1, 2, 3 and 4 GFLOP/s in whatever order they finish.
            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(kernel_output(request, n as f64))
        },
    );
    let orchestrator = Orchestrator::new(&executor, 2, dir.path().join("sweep"));
    let report = orchestrator.run_all(&plan(4, report_path.clone())).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(report.len(), 6);
    for (_, _, entry) in report.iter() {
        assert_eq!(entry.gflops_avg, 2.5);
        assert_eq!(entry.ms_avg, 5.0);
    }

    let written = Report::read_from(&report_path).unwrap();
    assert_eq!(written, report);
    let text = std::fs::read_to_string(&report_path).unwrap();
    assert_eq!(text.lines().next(), Some("avx256_unroll_blocking,64,5,2.5"));
    assert_eq!(text.lines().last(), Some("simple,192,5,2.5"));
}

#[test]
fn test_failed_trial_aborts_without_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.csv");
    let builds = AtomicUsize::new(0);

    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> {
            if builds.fetch_add(1, Ordering::SeqCst) == 2 {
                return Err(build_failed("exit status: 1", "dgemm.c: error"));
            }
            Ok(())
        },
        |_: &Path, request: &BenchRequest| -> Result<String> { Ok(kernel_output(request, 1.0)) },
    );
    let orchestrator = Orchestrator::new(&executor, 2, dir.path().join("sweep"));
    let result = orchestrator.run_all(&plan(6, report_path.clone()));

    assert!(matches!(result, Err(TuneError::BuildFailed { .. })));
    assert!(!report_path.exists());
}

#[test]
fn test_failure_keeps_previous_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.csv");
    std::fs::write(&report_path, "simple,64,1,1\n").unwrap();

    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> { Ok(()) },
        |_: &Path, _: &BenchRequest| -> Result<String> { Ok("simple,64,1\n".to_string()) },
    );
    let orchestrator = Orchestrator::new(&executor, 1, dir.path().join("sweep"));
    let result = orchestrator.run_all(&plan(2, report_path.clone()));

    assert!(matches!(result, Err(TuneError::MalformedOutput { .. })));
    assert_eq!(std::fs::read_to_string(&report_path).unwrap(), "simple,64,1,1\n");
}

#[test]
fn test_running_trials_never_share_a_binary() {
    let dir = tempfile::tempdir().unwrap();
    let sweep_dir = dir.path().join("sweep");
    let in_flight = Mutex::new(HashSet::new());
    let used = Mutex::new(HashSet::new());
    let collided = AtomicBool::new(false);

    let executor = TrialExecutor::new(
        |spec: &BuildSpec| -> Result<()> {
            if !in_flight.lock().unwrap().insert(spec.output_path.clone()) {
                collided.store(true, Ordering::SeqCst);
            }
            used.lock().unwrap().insert(spec.output_path.clone());
            thread::sleep(Duration::from_millis(10));
            Ok(())
        },
        |binary: &Path, request: &BenchRequest| -> Result<String> {
            thread::sleep(Duration::from_millis(10));
            in_flight.lock().unwrap().remove(binary);
            Ok(kernel_output(request, 1.0))
        },
    );
    let orchestrator = Orchestrator::new(&executor, 3, &sweep_dir);
    let trials = orchestrator
        .run_trials(&plan(12, dir.path().join("report.csv")))
        .unwrap();

    assert_eq!(trials.len(), 12);
    assert!(!collided.load(Ordering::SeqCst));
    let used = used.lock().unwrap();
    assert!(!used.is_empty() && used.len() <= 3);
    for path in used.iter() {
        assert!(path.starts_with(&sweep_dir));
        assert!(path.ends_with("dgemm"));
    }
}

#[test]
fn test_first_trials_are_staggered() {
    let dir = tempfile::tempdir().unwrap();
    let interval = Duration::from_millis(40);
    let starts = Mutex::new(Vec::new());

    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> {
            starts.lock().unwrap().push(Instant::now());
            Ok(())
        },
        |_: &Path, request: &BenchRequest| -> Result<String> { Ok(kernel_output(request, 1.0)) },
    );
    let orchestrator = Orchestrator::new(&executor, 3, dir.path().join("sweep"))
        .with_stagger(StaggerPolicy::new(interval, 3));

    let batch_start = Instant::now();
    orchestrator
        .run_trials(&plan(3, dir.path().join("report.csv")))
        .unwrap();

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    // Trial 1 waits one interval and trial 2 two, so only trial 0 starts early.
    let early = starts
        .iter()
        .filter(|t| t.duration_since(batch_start) < interval)
        .count();
    assert!(early <= 1);
    assert!(batch_start.elapsed() >= 2 * interval);
}

#[test]
fn test_stagger_follows_start_order_with_more_trials_than_workers() {
    let dir = tempfile::tempdir().unwrap();
    let interval = Duration::from_millis(150);
    let run_time = Duration::from_millis(250);
    let starts = Mutex::new(Vec::new());

    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> {
            starts.lock().unwrap().push(Instant::now());
            Ok(())
        },
        |_: &Path, request: &BenchRequest| -> Result<String> {
            thread::sleep(run_time);
            Ok(kernel_output(request, 1.0))
        },
    );
    let orchestrator = Orchestrator::new(&executor, 2, dir.path().join("sweep"))
        .with_stagger(StaggerPolicy::new(interval, 2));

    let batch_start = Instant::now();
    let trials = orchestrator
        .run_trials(&plan(4, dir.path().join("report.csv")))
        .unwrap();
    assert_eq!(trials.len(), 4);

    let mut offsets: Vec<Duration> = starts
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.duration_since(batch_start))
        .collect();
    offsets.sort();
    assert_eq!(offsets.len(), 4);

    // Expected starts: 0, 150 (second worker, staggered), 250 and 400 ms.
    let early = offsets.iter().filter(|&&t| t < Duration::from_millis(100)).count();
    assert_eq!(early, 1, "starts: {offsets:?}");
    assert!(offsets[1] >= interval, "starts: {offsets:?}");
    // The second start must not wait for the first trial to finish.
    assert!(offsets[1] < run_time + Duration::from_millis(200), "starts: {offsets:?}");
}

#[test]
fn test_single_worker_keeps_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let started = AtomicUsize::new(0);

    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> { Ok(()) },
        |_: &Path, request: &BenchRequest| -> Result<String> {
            let n = started.fetch_add(1, Ordering::SeqCst);
            Ok(kernel_output(request, (n + 1) as f64))
        },
    );
    let orchestrator = Orchestrator::new(&executor, 1, dir.path().join("sweep"));
    let trials = orchestrator
        .run_trials(&plan(5, dir.path().join("report.csv")))
        .unwrap();

    let key = ("simple".to_string(), 64);
    let firsts: Vec<f64> = trials.iter().map(|t| t[&key].gflops_sum).collect();
    assert_eq!(firsts, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_zero_pool_size_rejected() {
    let executor = TrialExecutor::new(
        |_: &BuildSpec| -> Result<()> { Ok(()) },
        |_: &Path, _: &BenchRequest| -> Result<String> { Ok(String::new()) },
    );
    let orchestrator = Orchestrator::new(&executor, 0, "out/sweep");
    assert!(matches!(
        orchestrator.run_trials(&plan(1, PathBuf::from("report.csv"))),
        Err(TuneError::InvalidConfig(_))
    ));
}
