// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs shell scripts speaking the libtest protocol.

use crate::fixtures::*;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use indoc::indoc;
use overman_runner::{
    RunOptions,
    config::RunConfig,
    list::TestPath,
    output::OutputSink,
    reporter::{
        JsonReporter,
        events::{ErrorPhase, ExecutionResult},
    },
    run,
    source::process::LibtestSource,
};
use pretty_assertions::assert_eq;
use std::{
    os::unix::fs::PermissionsExt,
    sync::{Arc, LazyLock},
    time::Duration,
};

const LIBTEST_SCRIPT: &str = indoc! {r#"
    #!/bin/sh
    if [ "$1" = "--list" ]; then
        echo "tests::passes: test"
        echo "tests::fails: test"
        echo "tests::hangs: test"
        echo "tests::flaky: test"
        echo "benches::fast: benchmark"
        exit 0
    fi

    case "$2" in
        tests::passes)
            echo "Hello"
            exit 0
            ;;
        tests::fails)
            echo "oops" >&2
            exit 3
            ;;
        tests::hangs)
            exec sleep 30
            ;;
        tests::flaky)
            echo "attempt $OVERMAN_ATTEMPT"
            [ "$OVERMAN_ATTEMPT" = "2" ]
            exit $?
            ;;
    esac
    exit 101
"#};

const BROKEN_LIST_SCRIPT: &str = indoc! {r#"
    #!/bin/sh
    echo "cannot list" >&2
    exit 1
"#};

/// Scripts are written once, before any test spawns a process. Writing an executable while
/// another thread forks can make executing it fail with `ETXTBSY`.
static SCRIPTS: LazyLock<Utf8TempDir> = LazyLock::new(|| {
    let dir = Utf8TempDir::new().expect("created temp dir");
    write_script(&dir.path().join("libtest.sh"), LIBTEST_SCRIPT);
    write_script(&dir.path().join("broken-list.sh"), BROKEN_LIST_SCRIPT);
    dir
});

fn write_script(path: &Utf8Path, contents: &str) {
    std::fs::write(path, contents).expect("wrote script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("made script executable");
}

fn script(name: &str) -> Utf8PathBuf {
    SCRIPTS.path().join(name)
}

#[tokio::test]
async fn runs_libtest_scripts() -> Result<()> {
    init_tracing();
    let file = script("libtest.sh");
    let recording = Recording::default();
    let (json_sink, json_output) = OutputSink::buffer();

    let mut options = RunOptions::new([file.clone()], Arc::new(LibtestSource::new()));
    options.timeout = Duration::from_millis(500);
    options.config = RunConfig {
        retries: 1,
        ..RunConfig::default()
    };
    options.reporters = vec![
        recording.reporter(),
        Box::new(JsonReporter::with_output(json_sink)),
    ];
    let stats = run(options).await?;

    // "fails" and "hangs" are retried once each, and "flaky" passes on its retry.
    assert_eq!(
        (stats.registered, stats.passed, stats.failed, stats.timed_out, stats.retries),
        (4, 2, 2, 2, 3)
    );

    let test = |name: &str| TestPath::from_libtest_name(&file, name);
    assert_eq!(
        recording.registered(),
        ["tests::passes", "tests::fails", "tests::hangs", "tests::flaky"].map(test)
    );

    let passes = test("tests::passes");
    assert_eq!(
        recording.messages(&passes),
        [
            Recorded::Start,
            Recorded::Stdio,
            finished(ExecutionResult::Success, false),
        ]
    );
    assert_eq!(recording.stdout(&passes), "Hello\n");

    let fails = test("tests::fails");
    let exit_error = error(ErrorPhase::Exit, "process exited with exit status: 3");
    assert_eq!(
        recording.messages(&fails),
        [
            Recorded::Start,
            Recorded::Stdio,
            exit_error.clone(),
            Recorded::Retry { attempt: 2 },
            Recorded::Start,
            Recorded::Stdio,
            exit_error,
            finished(ExecutionResult::Failure, false),
        ]
    );
    assert_eq!(recording.stderr(&fails), "oops\noops\n");

    let hangs = test("tests::hangs");
    let messages = recording.messages(&hangs);
    assert_eq!(
        messages.last(),
        Some(&finished(ExecutionResult::Failure, false))
    );
    assert!(
        messages.contains(&error(ErrorPhase::Timeout, "test timed out after 500ms")),
        "{messages:?}"
    );

    assert_eq!(
        recording.stdout(&test("tests::flaky")),
        "attempt 1\nattempt 2\n"
    );
    recording.assert_done_once();

    let json = json_output.to_string_lossy();
    let lines: Vec<serde_json::Value> = json
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines[0]["type"], "register");
    assert_eq!(lines[lines.len() - 1]["type"], "done");
    assert!(
        lines
            .iter()
            .any(|line| line["type"] == "stdio-chunk" && line["text"] == "Hello\n"),
        "stdout chunk in {json}"
    );

    Ok(())
}

#[tokio::test]
async fn listing_failures_are_internal_faults() -> Result<()> {
    init_tracing();
    let recording = Recording::default();
    let (internal_error_output, internal_errors) = OutputSink::buffer();

    let missing = SCRIPTS.path().join("does-not-exist.sh");
    let mut options = RunOptions::new(
        [script("broken-list.sh"), missing, script("libtest.sh")],
        Arc::new(LibtestSource::new()),
    );
    options.timeout = Duration::from_millis(500);
    options.reporters.push(recording.reporter());
    options.internal_error_output = internal_error_output;
    let stats = run(options).await?;

    assert_eq!((stats.registered, stats.internal_faults), (4, 2));
    let internal = internal_errors.to_string_lossy();
    assert!(internal.contains("--- stderr:\ncannot list\n"), "{internal}");
    assert!(
        internal.contains("does-not-exist.sh --list --format terse` failed"),
        "{internal}"
    );
    assert_eq!(internal.matches("internal error: ").count(), 2, "{internal}");
    recording.assert_done_once();

    Ok(())
}

#[tokio::test]
async fn attempts_see_the_source_environment() -> Result<()> {
    init_tracing();
    let recording = Recording::default();
    let file = script("libtest.sh");

    let mut source = LibtestSource::new();
    source.current_dir(SCRIPTS.path()).env("OVERMAN_ATTEMPT", "2");
    let mut options = RunOptions::new([file.clone()], Arc::new(source));
    options.timeout = Duration::from_millis(500);
    options.reporters.push(recording.reporter());
    let stats = run(options).await?;

    // The per-attempt variable is set after the source's environment, so it wins.
    let flaky = TestPath::from_libtest_name(&file, "tests::flaky");
    assert_eq!(recording.stdout(&flaky), "attempt 1\n");
    assert_eq!(stats.failed, 3);
    Ok(())
}
