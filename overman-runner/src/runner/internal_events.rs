// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! The executor sends these to the dispatcher, which validates them and passes them on to
//! reporters.

use crate::{
    list::{TestList, TestPath},
    reporter::events::{Message, RegistrationConfig},
};
use chrono::{DateTime, Local};
use std::sync::Arc;

/// An event sent by the executor to the dispatcher.
#[derive(Debug)]
pub(super) enum ExecutorEvent {
    /// A lifecycle message about a test.
    Message { test: TestPath, message: Message },

    /// Something went wrong that isn't the test's fault.
    InternalFault { test: TestPath, description: String },
}

/// An event sent by the dispatcher to a reporter host.
#[derive(Debug)]
pub(super) enum ReporterEvent {
    Register {
        tests: Arc<TestList>,
        config: RegistrationConfig,
        start_time: DateTime<Local>,
    },
    Message {
        test: TestPath,
        message: Message,
    },
    Done {
        end_time: DateTime<Local>,
    },
}
