// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs in-process suites end to end.

use crate::fixtures::*;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use indoc::formatdoc;
use overman_runner::{
    RunOptions,
    config::{RunConfig, TestThreads},
    errors::{ListError, ReporterError, RunError},
    list::TestPath,
    output::{CapturedOutput, OutputSink},
    reporter::{
        SpecReporter,
        events::{ErrorPhase, ExecutionResult},
    },
    run,
    source::{
        AttemptOutcome, TestAttempt, TestSource,
        in_process::{Suite, SuiteFile, SuiteRegistry, TestContext, TestFailure},
    },
};
use pretty_assertions::assert_eq;
use std::{
    future, io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

struct Harness {
    options: RunOptions,
    recording: Recording,
    internal_errors: CapturedOutput,
}

impl Harness {
    fn new(source: Arc<dyn TestSource>, files: Vec<Utf8PathBuf>) -> Self {
        init_tracing();
        let recording = Recording::default();
        let (internal_error_output, internal_errors) = OutputSink::buffer();

        let mut options = RunOptions::new(files, source);
        options.reporters.push(recording.reporter());
        options.internal_error_output = internal_error_output;
        Self {
            options,
            recording,
            internal_errors,
        }
    }

    fn for_registry(registry: SuiteRegistry) -> Self {
        let files = registry.files().map(Utf8Path::to_path_buf).collect();
        Self::new(Arc::new(registry), files)
    }
}

async fn fails(_cx: TestContext) -> Result<(), TestFailure> {
    Err(io::Error::other("an_error").into())
}

async fn panics(_cx: TestContext) -> Result<(), TestFailure> {
    panic!("boom");
}

#[tokio::test]
async fn mixed_results_with_spec_reporter() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "math",
        SuiteFile::new().suite(
            Suite::new("arithmetic")
                .test("adds", |cx| async move {
                    cx.stdout().write("Hello\n").await?;
                    Ok(())
                })
                .test("fails", fails),
        ),
    );
    let mut harness = Harness::for_registry(registry);
    let (sink, spec_output) = OutputSink::buffer();
    harness
        .options
        .reporters
        .push(Box::new(SpecReporter::with_output(sink)));
    harness.options.config.test_threads = TestThreads::Count(1);

    let stats = run(harness.options).await?;
    assert_eq!(
        (stats.registered, stats.finished, stats.passed, stats.failed),
        (2, 2, 1, 1)
    );
    assert!(!stats.is_success());

    let adds = TestPath::new("math", ["arithmetic", "adds"]);
    let failing = TestPath::new("math", ["arithmetic", "fails"]);
    assert_eq!(harness.recording.registered(), [adds.clone(), failing.clone()]);
    assert_eq!(
        harness.recording.messages(&adds),
        [
            Recorded::Start,
            Recorded::Stdio,
            finished(ExecutionResult::Success, false),
        ]
    );
    assert_eq!(harness.recording.stdout(&adds), "Hello\n");
    assert_eq!(
        harness.recording.messages(&failing),
        [
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Uncaught, "an_error"),
            finished(ExecutionResult::Failure, false),
        ]
    );
    harness.recording.assert_done_once();

    let output = spec_output.to_string_lossy();
    for expected in [
        // Captured output precedes the test's status line.
        "\n  arithmetic\nHello\n    ✓ adds\n",
        "    1) fails\n",
        "\n  1 passing (",
        "  1 failing\n",
        "\n  1) arithmetic fails:\n     Uncaught error: an_error\n",
    ] {
        assert!(output.contains(expected), "{expected:?} in output:\n{output}");
    }
    assert_eq!(output.matches("arithmetic\n").count(), 1, "suite printed once");
    assert!(harness.internal_errors.contents().is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timeout_does_not_wait_for_body() -> Result<()> {
    let dropped = Arc::new(AtomicBool::new(false));

    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let mut registry = SuiteRegistry::new();
    let flag = dropped.clone();
    registry.add_file(
        "file",
        SuiteFile::new().test("hangs", move |_| {
            let guard = SetOnDrop(flag.clone());
            async move {
                let _guard = guard;
                future::pending::<()>().await;
                Ok(())
            }
        }),
    );
    let mut harness = Harness::for_registry(registry);
    harness.options.timeout = Duration::from_millis(100);

    let stats = run(harness.options).await?;
    assert_eq!((stats.failed, stats.timed_out), (1, 1));

    let hangs = TestPath::new("file", ["hangs"]);
    assert_eq!(
        harness.recording.messages(&hangs),
        [
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Timeout, "test timed out after 100ms"),
            finished(ExecutionResult::Failure, false),
        ]
    );
    assert_eq!(harness.recording.config().timeout, Duration::from_millis(100));
    assert!(harness.recording.duration(&hangs) >= Duration::from_millis(100));

    // The body is cancelled once the abort is processed.
    tokio::task::yield_now().await;
    assert!(dropped.load(Ordering::SeqCst), "test body was dropped");
    Ok(())
}

#[tokio::test]
async fn retries_restart_the_sequence() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new().test("flaky", |cx| async move {
            cx.stdout()
                .write(format!("attempt {}\n", cx.attempt()))
                .await?;
            if cx.attempt() < 3 {
                return Err("not yet".into());
            }
            Ok(())
        }),
    );
    let mut harness = Harness::for_registry(registry);
    harness.options.config.retries = 2;

    let stats = run(harness.options).await?;
    assert_eq!((stats.passed, stats.failed, stats.retries), (1, 0, 2));
    assert!(stats.is_success());

    let flaky = TestPath::new("file", ["flaky"]);
    assert_eq!(
        harness.recording.messages(&flaky),
        [
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Uncaught, "not yet"),
            Recorded::Retry { attempt: 2 },
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Uncaught, "not yet"),
            Recorded::Retry { attempt: 3 },
            Recorded::Start,
            Recorded::Stdio,
            finished(ExecutionResult::Success, false),
        ]
    );
    assert_eq!(
        harness.recording.stdout(&flaky),
        "attempt 1\nattempt 2\nattempt 3\n"
    );
    Ok(())
}

#[tokio::test]
async fn panics_are_contained() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new()
            .test("panics", panics)
            .test("passes", |_| async { Ok(()) }),
    );
    let harness = Harness::for_registry(registry);

    let stats = run(harness.options).await?;
    assert_eq!((stats.passed, stats.failed, stats.internal_faults), (1, 1, 0));
    assert_eq!(
        harness.recording.messages(&TestPath::new("file", ["panics"])),
        [
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Uncaught, "boom"),
            finished(ExecutionResult::Failure, false),
        ]
    );
    harness.recording.assert_done_once();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn per_test_overrides_win_over_defaults() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new()
            .test("lower_threshold", |cx| async move {
                cx.set_slow_threshold(Duration::from_millis(10));
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .test("raised_threshold", |cx| async move {
                cx.set_slow_threshold(Duration::from_secs(10));
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .test("default_threshold", |_| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .test("shorter_timeout", |cx| async move {
                cx.set_timeout(Duration::from_millis(20));
                future::pending::<()>().await;
                Ok(())
            })
            .test("longer_timeout", |cx| async move {
                cx.set_timeout(Duration::from_secs(60));
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
    );
    let mut harness = Harness::for_registry(registry);
    harness.options.timeout = Duration::from_secs(5);
    harness.options.config.slow_threshold = Duration::from_secs(1);

    let stats = run(harness.options).await?;
    assert_eq!((stats.passed, stats.failed, stats.timed_out), (4, 1, 1));

    let last = |name: &str| {
        harness
            .recording
            .messages(&TestPath::new("file", [name]))
            .pop()
            .expect("test has messages")
    };
    assert_eq!(
        last("lower_threshold"),
        finished(ExecutionResult::Success, true)
    );
    assert_eq!(
        last("raised_threshold"),
        finished(ExecutionResult::Success, false)
    );
    assert_eq!(
        last("default_threshold"),
        finished(ExecutionResult::Success, true)
    );
    assert_eq!(
        last("longer_timeout"),
        finished(ExecutionResult::Success, true)
    );
    assert_eq!(
        harness
            .recording
            .messages(&TestPath::new("file", ["shorter_timeout"]))[2],
        error(ErrorPhase::Timeout, "test timed out after 20ms")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn parallelism_is_bounded() -> Result<()> {
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let mut file = SuiteFile::new();
    for index in 0..8 {
        let running = running.clone();
        let max_running = max_running.clone();
        file = file.test(format!("test_{index}"), move |_| {
            let running = running.clone();
            let max_running = max_running.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    let mut registry = SuiteRegistry::new();
    registry.add_file("file", file);

    let mut harness = Harness::for_registry(registry);
    harness.options.config = RunConfig {
        test_threads: TestThreads::Count(3),
        ..RunConfig::default()
    };

    let stats = run(harness.options).await?;
    assert_eq!(stats.passed, 8);
    assert_eq!(max_running.load(Ordering::SeqCst), 3);
    harness.recording.assert_done_once();
    Ok(())
}

#[tokio::test]
async fn listing_failures_are_internal_faults() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file("known", SuiteFile::new().test("passes", |_| async { Ok(()) }));
    let harness = Harness::new(
        Arc::new(registry),
        vec!["missing".into(), "known".into()],
    );

    let stats = run(harness.options).await?;
    assert_eq!(
        (stats.registered, stats.passed, stats.internal_faults),
        (1, 1, 1)
    );
    assert!(!stats.is_success());
    assert_eq!(
        harness.internal_errors.to_string_lossy(),
        "internal error: test file `missing` is not known to the test source\n"
    );
    harness.recording.assert_done_once();
    Ok(())
}

#[tokio::test]
async fn duplicate_tests_are_dropped() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new()
            .test("twice", |_| async { Ok(()) })
            .test("twice", |_| async { Ok(()) }),
    );
    let harness = Harness::for_registry(registry);

    let stats = run(harness.options).await?;
    assert_eq!(
        (stats.registered, stats.passed, stats.internal_faults),
        (1, 1, 1)
    );
    assert!(
        harness
            .internal_errors
            .to_string_lossy()
            .contains("was registered more than once")
    );
    Ok(())
}

#[tokio::test]
async fn failing_reporter_does_not_stop_the_run() -> Result<()> {
    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new()
            .test("a", |_| async { Ok(()) })
            .test("b", |_| async { Ok(()) }),
    );
    let mut harness = Harness::for_registry(registry);
    harness.options.reporters.insert(0, Box::new(FailingReporter));

    let err = run(harness.options)
        .await
        .expect_err("failing reporter is reported");
    let RunError::Reporters { stats, errors } = err else {
        panic!("expected reporter errors, found {err:?}");
    };
    assert_eq!(stats.passed, 2);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ReporterError::Io(_)), "{:?}", errors[0]);
    harness.recording.assert_done_once();
    Ok(())
}

/// A source whose attempts bring down the executor.
#[derive(Debug)]
struct ExplodingSource;

#[async_trait]
impl TestSource for ExplodingSource {
    async fn list_tests(&self, file: &Utf8Path) -> Result<Vec<TestPath>, ListError> {
        Ok(vec![TestPath::new(file, ["explodes"])])
    }

    async fn run_attempt(&self, _attempt: TestAttempt) -> AttemptOutcome {
        panic!("source exploded");
    }
}

#[tokio::test]
async fn executor_panics_force_finish_the_test() -> Result<()> {
    let harness = Harness::new(Arc::new(ExplodingSource), vec!["file".into()]);

    let stats = run(harness.options).await?;
    assert_eq!((stats.finished, stats.failed, stats.internal_faults), (1, 1, 1));

    let trace = "test `file: explodes` did not finish (executor panicked: source exploded)";
    assert_eq!(
        harness
            .recording
            .messages(&TestPath::new("file", ["explodes"])),
        [
            Recorded::Start,
            Recorded::Stdio,
            error(ErrorPhase::Internal, trace),
            finished(ExecutionResult::Failure, false),
        ]
    );
    assert_eq!(
        harness.internal_errors.to_string_lossy(),
        format!("internal error: {trace}\n")
    );
    harness.recording.assert_done_once();
    Ok(())
}

#[tokio::test]
async fn configured_reporters_write_files() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let junit_path = dir.path().join("reports/junit.xml");
    let json_path = dir.path().join("reports/events.jsonl");
    let config = RunConfig::from_toml_str(&formatdoc! {r#"
        timeout = "2s"
        retries = 1
        test-threads = 2

        [[reporters]]
        kind = "junit"
        path = "{junit_path}"
        name = "overman-integration"

        [[reporters]]
        kind = "json"
        path = "{json_path}"
    "#})?;

    let mut registry = SuiteRegistry::new();
    registry.add_file(
        "file",
        SuiteFile::new().suite(
            Suite::new("suite")
                .test("passes", |cx| async move {
                    cx.stdout().write("out\n").await?;
                    Ok(())
                })
                .test("fails", fails),
        ),
    );
    let mut harness = Harness::for_registry(registry);
    harness.options.timeout = config.timeout;
    harness
        .options
        .reporters
        .extend(config.build_reporters().await?);
    harness.options.config = config;

    let stats = run(harness.options).await?;
    assert_eq!((stats.passed, stats.failed, stats.retries), (1, 1, 1));
    harness.recording.assert_done_once();

    let junit = std::fs::read_to_string(&junit_path)?;
    for expected in [
        r#"name="overman-integration""#,
        r#"name="passes""#,
        r#"classname="suite""#,
        "an_error",
        "out",
    ] {
        assert!(junit.contains(expected), "{expected} in:\n{junit}");
    }

    let json = std::fs::read_to_string(&json_path)?;
    let kinds: Vec<String> = json
        .lines()
        .map(|line| -> Result<String> {
            let value: serde_json::Value = serde_json::from_str(line)?;
            Ok(value["type"].as_str().unwrap_or_default().to_owned())
        })
        .collect::<Result<_>>()?;
    assert_eq!(kinds.first().map(String::as_str), Some("register"));
    assert_eq!(kinds.last().map(String::as_str), Some("done"));
    assert_eq!(kinds.iter().filter(|kind| *kind == "retry").count(), 1);
    assert_eq!(kinds.iter().filter(|kind| *kind == "finish").count(), 2);

    Ok(())
}
