// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests defined in code and run as tokio tasks.
//!
//! ```
//! use overman_runner::source::in_process::{Suite, SuiteFile, SuiteRegistry};
//!
//! let mut registry = SuiteRegistry::new();
//! registry.add_file(
//!     "math",
//!     SuiteFile::new().suite(
//!         Suite::new("arithmetic")
//!             .test("adds", |cx| async move {
//!                 cx.stdout().write("checking 1 + 1\n").await?;
//!                 assert_eq!(1 + 1, 2);
//!                 Ok(())
//!             }),
//!     ),
//! );
//! ```

use super::{AttemptOutcome, TestAttempt, TestOverrides, TestSource};
use crate::{
    errors::{DisplayErrorChain, ListError, StartAttemptError},
    helpers::{AbortOnDrop, panic_message},
    list::TestPath,
    reporter::events::ErrorPhase,
    test_output::StdioWriter,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use std::{collections::HashMap, error::Error, fmt, future::Future, sync::Arc, time::Duration};
use tracing::debug;

/// The error type test bodies return.
pub type TestFailure = Box<dyn Error + Send + Sync>;

type TestFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, Result<(), TestFailure>> + Send + Sync>;

/// What a running test body can see and control.
pub struct TestContext {
    test: TestPath,
    attempt: usize,
    stdout: StdioWriter,
    stderr: StdioWriter,
    overrides: TestOverrides,
}

impl TestContext {
    /// The path of the running test.
    pub fn path(&self) -> &TestPath {
        &self.test
    }

    /// The 1-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The test's standard output stream.
    pub fn stdout(&self) -> &StdioWriter {
        &self.stdout
    }

    /// The test's standard error stream.
    pub fn stderr(&self) -> &StdioWriter {
        &self.stderr
    }

    /// Overrides the slow threshold for this attempt.
    pub fn set_slow_threshold(&self, threshold: Duration) {
        self.overrides.set_slow_threshold(threshold);
    }

    /// Overrides the timeout for this attempt, measured from when the attempt started.
    pub fn set_timeout(&self, timeout: Duration) {
        self.overrides.set_timeout(timeout);
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test", &self.test)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

enum Entry {
    Suite(Suite),
    Test { name: String, body: TestFn },
}

/// A named group of tests and nested suites.
pub struct Suite {
    name: String,
    entries: Vec<Entry>,
}

impl Suite {
    /// Creates an empty suite.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Adds a test.
    pub fn test<F, Fut>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.entries.push(make_test(name, body));
        self
    }

    /// Adds a nested suite.
    pub fn suite(mut self, suite: Suite) -> Self {
        self.entries.push(Entry::Suite(suite));
        self
    }
}

/// The top level of a test file: tests and suites without an enclosing suite.
#[derive(Default)]
pub struct SuiteFile {
    entries: Vec<Entry>,
}

impl SuiteFile {
    /// Creates an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a top-level test.
    pub fn test<F, Fut>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.entries.push(make_test(name, body));
        self
    }

    /// Adds a top-level suite.
    pub fn suite(mut self, suite: Suite) -> Self {
        self.entries.push(Entry::Suite(suite));
        self
    }
}

fn make_test<F, Fut>(name: impl Into<String>, body: F) -> Entry
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
{
    let body: TestFn = Arc::new(move |cx| body(cx).boxed());
    Entry::Test {
        name: name.into(),
        body,
    }
}

#[derive(Default)]
struct RegisteredFile {
    // Definition order, which is also the listing order.
    tests: Vec<Vec<String>>,
    bodies: HashMap<Vec<String>, TestFn>,
}

impl RegisteredFile {
    fn flatten(&mut self, prefix: &mut Vec<String>, entries: Vec<Entry>) {
        for entry in entries {
            match entry {
                Entry::Suite(suite) => {
                    prefix.push(suite.name);
                    self.flatten(prefix, suite.entries);
                    prefix.pop();
                }
                Entry::Test { name, body } => {
                    let mut path = prefix.clone();
                    path.push(name);
                    // Duplicates are listed, and the runner reports them.
                    self.bodies.entry(path.clone()).or_insert(body);
                    self.tests.push(path);
                }
            }
        }
    }
}

/// A [`TestSource`] for tests defined in code.
#[derive(Default)]
pub struct SuiteRegistry {
    files: IndexMap<Utf8PathBuf, RegisteredFile>,
}

impl SuiteRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the tests in `contents` under `file`, after any tests already added for it.
    pub fn add_file(&mut self, file: impl Into<Utf8PathBuf>, contents: SuiteFile) -> &mut Self {
        let registered = self.files.entry(file.into()).or_default();
        registered.flatten(&mut Vec::new(), contents.entries);
        self
    }

    /// Returns the files in the registry, in the order they were added.
    pub fn files(&self) -> impl Iterator<Item = &Utf8Path> + '_ {
        self.files.keys().map(|file| file.as_path())
    }

    fn body(&self, test: &TestPath) -> Option<TestFn> {
        self.files.get(test.file())?.bodies.get(test.path()).cloned()
    }
}

impl fmt::Debug for SuiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteRegistry")
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl TestSource for SuiteRegistry {
    async fn list_tests(&self, file: &Utf8Path) -> Result<Vec<TestPath>, ListError> {
        let registered = self.files.get(file).ok_or_else(|| ListError::UnknownFile {
            file: file.to_path_buf(),
        })?;
        Ok(registered
            .tests
            .iter()
            .map(|path| TestPath::new(file, path.iter().cloned()))
            .collect())
    }

    async fn run_attempt(&self, attempt: TestAttempt) -> AttemptOutcome {
        let TestAttempt {
            test,
            attempt,
            stdout,
            stderr,
            overrides,
        } = attempt;

        let Some(body) = self.body(&test) else {
            return AttemptOutcome::StartFailed(StartAttemptError::new(
                test,
                "test is not defined in the registry",
            ));
        };

        let cx = TestContext {
            test: test.clone(),
            attempt,
            stdout,
            stderr,
            overrides,
        };
        debug!(%test, attempt, "spawning in-process test");

        // Dropping this future (for example on timeout) aborts the task.
        let task = AbortOnDrop(tokio::spawn(body(cx)));
        match task.await {
            Ok(Ok(())) => AttemptOutcome::Passed,
            Ok(Err(error)) => AttemptOutcome::failed(
                ErrorPhase::Uncaught,
                DisplayErrorChain::new(&*error).to_string(),
            ),
            Err(error) if error.is_panic() => {
                let payload = error.into_panic();
                AttemptOutcome::failed(ErrorPhase::Uncaught, panic_message(&*payload))
            }
            Err(error) => AttemptOutcome::failed(
                ErrorPhase::Internal,
                format!("test task did not complete: {error}"),
            ),
        }
    }
}
