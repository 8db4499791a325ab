// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle messages exchanged about a test.
//!
//! Messages are produced by the [`TestRunner`](crate::runner::TestRunner) and consumed by a
//! [`Reporter`](crate::reporter::Reporter).

use crate::test_output::StdioReader;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Run-wide settings passed to reporters at registration time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistrationConfig {
    /// Attempts taking at least this long are flagged as slow, unless a test overrides it.
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,

    /// The maximum wall-clock time of an attempt, unless a test overrides it.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The number of times a failing test is retried.
    pub retries: usize,
}

/// A lifecycle message about one test.
///
/// For a given test, messages always arrive in this order: one `Start`, any number of `Stdio`
/// and `Error` messages, and one terminal `Finish`. A `Retry` in place of the `Finish` means the
/// attempt failed and another `Start` follows.
#[derive(Debug)]
pub enum Message {
    /// An attempt of the test has begun.
    Start,

    /// The attempt's captured output is available as live streams.
    Stdio {
        /// Standard output of the attempt.
        stdout: StdioReader,

        /// Standard error of the attempt.
        stderr: StdioReader,
    },

    /// Something went wrong during the attempt.
    Error {
        /// The phase the error occurred in.
        phase: ErrorPhase,

        /// The verbatim diagnostic.
        trace: String,
    },

    /// The test finished. This is the terminal message.
    Finish {
        /// Whether the test passed.
        result: ExecutionResult,

        /// The wall-clock time of the final attempt.
        duration: Duration,

        /// True if the duration met or exceeded the slow threshold.
        slow: bool,
    },

    /// The previous attempt failed, and the test is about to be retried.
    Retry {
        /// The 1-based number of the attempt that follows.
        attempt: usize,
    },
}

impl Message {
    /// Returns the kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Start => MessageKind::Start,
            Self::Stdio { .. } => MessageKind::Stdio,
            Self::Error { .. } => MessageKind::Error,
            Self::Finish { .. } => MessageKind::Finish,
            Self::Retry { .. } => MessageKind::Retry,
        }
    }

    /// Returns a copy of this message.
    ///
    /// `Stdio` readers are forked, so the copy sees the same bytes as the original from its
    /// current position onwards, independently of it.
    pub fn fork(&self) -> Self {
        match self {
            Self::Start => Self::Start,
            Self::Stdio { stdout, stderr } => Self::Stdio {
                stdout: stdout.fork(),
                stderr: stderr.fork(),
            },
            Self::Error { phase, trace } => Self::Error {
                phase: *phase,
                trace: trace.clone(),
            },
            Self::Finish {
                result,
                duration,
                slow,
            } => Self::Finish {
                result: *result,
                duration: *duration,
                slow: *slow,
            },
            Self::Retry { attempt } => Self::Retry { attempt: *attempt },
        }
    }
}

/// The kind of a [`Message`], without its payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// See [`Message::Start`].
    Start,
    /// See [`Message::Stdio`].
    Stdio,
    /// See [`Message::Error`].
    Error,
    /// See [`Message::Finish`].
    Finish,
    /// See [`Message::Retry`].
    Retry,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stdio => "stdio",
            Self::Error => "error",
            Self::Finish => "finish",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// The phase of a test's lifetime an error occurred in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPhase {
    /// The test body panicked or returned an error.
    Uncaught,

    /// The attempt ran past its timeout.
    Timeout,

    /// The test process exited unsuccessfully.
    Exit,

    /// The runner could not execute the test.
    Internal,
}

impl ErrorPhase {
    /// A human-readable label for this phase.
    pub fn label(self) -> &'static str {
        match self {
            Self::Uncaught => "Uncaught error",
            Self::Timeout => "Timeout",
            Self::Exit => "Process error",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uncaught => "uncaught",
            Self::Timeout => "timeout",
            Self::Exit => "exit",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The result of a finished test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionResult {
    /// The test passed.
    Success,

    /// The test failed.
    Failure,
}

impl ExecutionResult {
    /// Returns true if the test passed.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}
