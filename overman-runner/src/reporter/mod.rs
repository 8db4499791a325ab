// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report the progress and results of a test run.
//!
//! The main type here is the [`Reporter`] trait. A reporter is told which tests will run, then
//! receives every lifecycle [`Message`](events::Message) for each test, then is told that the
//! run is done. Several implementations are provided:
//!
//! * [`SpecReporter`]: human-readable, nested output.
//! * [`JunitReporter`]: a JUnit XML report.
//! * [`JsonReporter`]: one JSON object per line, for consumption by other processes.
//! * [`CombinedReporter`]: forwards to several reporters.

mod combined;
pub mod events;
mod helpers;
mod json;
mod junit;
pub mod protocol;
mod spec;

pub use combined::CombinedReporter;
pub use json::JsonReporter;
pub use junit::JunitReporter;
pub use spec::SpecReporter;

use crate::{
    errors::ReporterError,
    list::{TestList, TestPath},
};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use events::{Message, RegistrationConfig};

/// A consumer of test lifecycle events.
///
/// The runner calls `register_tests` exactly once, then `got_message` for every message in the
/// order described by [`Message`], then `done` exactly once after every test has finished.
/// Messages about different tests may interleave arbitrarily.
///
/// Each reporter is driven from its own task, so a slow reporter never holds up the run or
/// other reporters. Returning an error stops the reporter; the run continues without it.
#[async_trait]
pub trait Reporter: Send {
    /// Called once, before any messages, with every test that will run.
    async fn register_tests(
        &mut self,
        tests: &TestList,
        config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError>;

    /// Called for each lifecycle message about a test.
    async fn got_message(&mut self, test: &TestPath, message: Message)
    -> Result<(), ReporterError>;

    /// Called once every test has finished.
    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError>;
}

#[async_trait]
impl<R: Reporter + ?Sized> Reporter for Box<R> {
    async fn register_tests(
        &mut self,
        tests: &TestList,
        config: &RegistrationConfig,
        start_time: DateTime<Local>,
    ) -> Result<(), ReporterError> {
        (**self).register_tests(tests, config, start_time).await
    }

    async fn got_message(
        &mut self,
        test: &TestPath,
        message: Message,
    ) -> Result<(), ReporterError> {
        (**self).got_message(test, message).await
    }

    async fn done(&mut self, end_time: DateTime<Local>) -> Result<(), ReporterError> {
        (**self).done(end_time).await
    }
}
