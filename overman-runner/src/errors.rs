// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by overman.

use crate::{
    helpers::plural,
    list::TestPath,
    reporter::{events::MessageKind, protocol::ProtocolState},
    runner::RunStats,
};
use camino::Utf8PathBuf;
use std::{error::Error, fmt, process::ExitStatus, string::FromUtf8Error};
use thiserror::Error;

/// A test was registered more than once in a run.
#[derive(Clone, Debug, Error)]
#[error("test `{test}` was registered more than once")]
pub struct DuplicateTestError {
    test: TestPath,
}

impl DuplicateTestError {
    pub(crate) fn new(test: TestPath) -> Self {
        Self { test }
    }

    /// The test that was registered twice.
    pub fn test(&self) -> &TestPath {
        &self.test
    }
}

/// A lifecycle message arrived out of order for a test.
///
/// This always indicates a bug in whatever produced the messages, so it is never ignored.
#[derive(Clone, Debug, Error)]
#[error("protocol violation for `{test}`: received `{message}` while the test was {state}")]
pub struct ProtocolViolation {
    test: TestPath,
    message: MessageKind,
    state: ProtocolState,
}

impl ProtocolViolation {
    pub(crate) fn new(test: TestPath, message: MessageKind, state: ProtocolState) -> Self {
        Self {
            test,
            message,
            state,
        }
    }

    /// The test the offending message was about.
    pub fn test(&self) -> &TestPath {
        &self.test
    }

    /// The kind of the offending message.
    pub fn message(&self) -> MessageKind {
        self.message
    }

    /// The state the test was in when the message arrived.
    pub fn state(&self) -> ProtocolState {
        self.state
    }
}

/// An error returned by a [`Reporter`](crate::reporter::Reporter).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReporterError {
    /// An error occurred while writing to the reporter's output.
    #[error("error writing to reporter output")]
    Io(#[from] std::io::Error),

    /// The reporter observed an out-of-order message.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// Tests were registered with the reporter more than once.
    #[error("tests were registered with the reporter more than once")]
    AlreadyRegistered,

    /// The reporter received a message before any tests were registered.
    #[error("reporter received a message before tests were registered")]
    NotRegistered,

    /// An error occurred while producing JUnit XML.
    #[error("error serializing JUnit report")]
    Junit(#[source] quick_junit::SerializeError),

    /// An error occurred while serializing an event to JSON.
    #[error("error serializing event to JSON")]
    Json(#[source] serde_json::Error),

    /// The reporter panicked.
    #[error("reporter panicked: {message}")]
    Panicked {
        /// The panic message.
        message: String,
    },
}

/// An error that occurred while listing the tests in a file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListError {
    /// The file is not known to the test source.
    #[error("test file `{file}` is not known to the test source")]
    UnknownFile {
        /// The file that was requested.
        file: Utf8PathBuf,
    },

    /// Running the list command failed.
    #[error("running `{}` failed", .command.join(" "))]
    CommandExecFail {
        /// The file being listed.
        file: Utf8PathBuf,

        /// The command that was run.
        command: Vec<String>,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The list command exited with a failure.
    #[error(
        "running `{}` exited with {exit_status}\n--- stderr:\n{stderr}\n---",
        .command.join(" ")
    )]
    CommandFail {
        /// The file being listed.
        file: Utf8PathBuf,

        /// The command that was run.
        command: Vec<String>,

        /// The exit status of the command.
        exit_status: ExitStatus,

        /// Standard error of the command.
        stderr: String,
    },

    /// The output of the list command was not valid UTF-8.
    #[error("list output for `{file}` was not valid UTF-8")]
    OutputNotUtf8 {
        /// The file being listed.
        file: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: FromUtf8Error,
    },

    /// A line of the list output could not be parsed.
    #[error("error parsing list output for `{file}`: {message}\nfull output:\n{full_output}")]
    ParseLine {
        /// The file being listed.
        file: Utf8PathBuf,

        /// A description of what went wrong.
        message: String,

        /// The full output of the list command.
        full_output: String,
    },
}

impl ListError {
    pub(crate) fn parse_line(
        file: impl Into<Utf8PathBuf>,
        message: impl Into<String>,
        full_output: impl Into<String>,
    ) -> Self {
        Self::ParseLine {
            file: file.into(),
            message: message.into(),
            full_output: full_output.into(),
        }
    }
}

/// A test source could not start an attempt of a test.
///
/// This is an internal fault: it is not caused by the test body itself.
#[derive(Debug, Error)]
#[error("failed to start `{test}`")]
pub struct StartAttemptError {
    test: TestPath,
    #[source]
    error: Box<dyn Error + Send + Sync>,
}

impl StartAttemptError {
    /// Creates a new error for the given test.
    pub fn new(test: TestPath, error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            test,
            error: error.into(),
        }
    }

    /// The test that failed to start.
    pub fn test(&self) -> &TestPath {
        &self.test
    }
}

/// An error that occurred while building a [`TestRunner`](crate::runner::TestRunner).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// No test files were provided.
    #[error("at least one test file must be provided")]
    NoFiles,

    /// No reporters were provided.
    #[error("at least one reporter must be provided")]
    NoReporters,

    /// The timeout was zero.
    #[error("the per-test timeout must be greater than zero")]
    ZeroTimeout,
}

/// An error that aborted a run, or that occurred while reporting on it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The runner could not be built from the options.
    #[error("invalid run options")]
    Build(#[from] TestRunnerBuildError),

    /// The runner produced an out-of-order message. The run was aborted.
    #[error("run aborted")]
    Protocol(#[source] ProtocolViolation),

    /// One or more reporters failed. The run itself completed.
    #[error("{} {} failed", .errors.len(), plural::reporters_str(.errors.len()))]
    Reporters {
        /// Statistics for the completed run.
        stats: RunStats,

        /// The errors produced by the reporters.
        errors: Vec<ReporterError>,
    },
}

/// An error that occurred while parsing configuration.
#[derive(Debug, Error)]
#[error("failed to parse overman config")]
#[non_exhaustive]
pub struct ConfigParseError {
    #[source]
    err: toml::de::Error,
}

impl ConfigParseError {
    pub(crate) fn new(err: toml::de::Error) -> Self {
        Self { err }
    }
}

/// Displays an error along with its chain of sources.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut cause = self.error.source();
        if cause.is_some() {
            write!(f, "\n  caused by:")?;
        }
        while let Some(source) = cause {
            write!(f, "\n  - {source}")?;
            cause = source.source();
        }

        Ok(())
    }
}
