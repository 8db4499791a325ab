// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests in executables that follow the libtest command-line protocol.
//!
//! A test file is an executable. Its tests are listed with `<file> --list --format terse`, and
//! each attempt runs `<file> --exact <name> --nocapture` as a child process. A test passes if the
//! process exits successfully.

use super::{AttemptOutcome, TestAttempt, TestSource};
use crate::{
    errors::{ListError, StartAttemptError},
    list::TestPath,
    reporter::events::ErrorPhase,
    test_output::StdioWriter,
};
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Stdio;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{debug, warn};

/// The environment variable holding the 1-based attempt number of a test process.
pub const ATTEMPT_ENV: &str = "OVERMAN_ATTEMPT";

/// A [`TestSource`] running libtest-compatible executables.
#[derive(Clone, Debug, Default)]
pub struct LibtestSource {
    cwd: Option<Utf8PathBuf>,
    envs: Vec<(String, String)>,
}

impl LibtestSource {
    /// Creates a source that runs test files in the current directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs test files in `cwd`.
    pub fn current_dir(&mut self, cwd: impl Into<Utf8PathBuf>) -> &mut Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets an environment variable for every listing and test process.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self, file: &Utf8Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(file.as_std_path());
        cmd.args(args).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    /// Parses the output of `--list --format terse`.
    fn parse(file: &Utf8Path, list_output: &str) -> Result<Vec<TestPath>, ListError> {
        // The output is in the form:
        // <test name>: test
        // <bench name>: benchmark
        // ...
        let mut tests = Vec::new();
        for line in list_output.lines().filter(|line| !line.trim().is_empty()) {
            if let Some(name) = line.strip_suffix(": test") {
                tests.push(TestPath::from_libtest_name(file, name));
            } else if line.strip_suffix(": benchmark").is_none() {
                return Err(ListError::parse_line(
                    file,
                    format!("line '{line}' did not end with the string ': test' or ': benchmark'"),
                    list_output,
                ));
            }
        }
        Ok(tests)
    }
}

#[async_trait]
impl TestSource for LibtestSource {
    async fn list_tests(&self, file: &Utf8Path) -> Result<Vec<TestPath>, ListError> {
        let args = ["--list", "--format", "terse"];
        let command = || {
            std::iter::once(file.to_string())
                .chain(args.iter().map(|arg| (*arg).to_owned()))
                .collect::<Vec<_>>()
        };

        debug!(%file, "listing tests");
        let output = self
            .command(file, &args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| ListError::CommandExecFail {
                file: file.to_path_buf(),
                command: command(),
                error,
            })?;

        if !output.status.success() {
            return Err(ListError::CommandFail {
                file: file.to_path_buf(),
                command: command(),
                exit_status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|error| ListError::OutputNotUtf8 {
            file: file.to_path_buf(),
            error,
        })?;
        Self::parse(file, &stdout)
    }

    async fn run_attempt(&self, attempt: TestAttempt) -> AttemptOutcome {
        let name = attempt.test.libtest_name();
        let mut cmd = self.command(
            attempt.test.file(),
            &["--exact", name.as_str(), "--nocapture"],
        );
        cmd.env(ATTEMPT_ENV, attempt.attempt.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the attempt (for example on timeout) kills the process.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                return AttemptOutcome::StartFailed(StartAttemptError::new(attempt.test, error));
            }
        };
        debug!(test = %attempt.test, pid = ?child.id(), "spawned test process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            forward(stdout, &attempt.stdout),
            forward(stderr, &attempt.stderr),
        );

        match status {
            Ok(status) if status.success() => AttemptOutcome::Passed,
            Ok(status) => {
                AttemptOutcome::failed(ErrorPhase::Exit, format!("process exited with {status}"))
            }
            Err(error) => AttemptOutcome::failed(
                ErrorPhase::Internal,
                format!("error waiting for test process: {error}"),
            ),
        }
    }
}

/// Copies a child pipe into a stream until the pipe is closed.
async fn forward(pipe: Option<impl AsyncRead + Unpin>, writer: &StdioWriter) {
    let Some(mut pipe) = pipe else {
        return;
    };

    let mut buf = vec![0; 8 * 1024];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // Keep draining the pipe even if nobody listens, so the child doesn't block.
                if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    debug!("output stream closed, discarding child output");
                }
            }
            Err(error) => {
                warn!(%error, "error reading test process output");
                break;
            }
        }
    }
}
