// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for the overman test runner.
//!
//! A run is driven by the [`runner`]: it asks a [`source::TestSource`] for the tests in each
//! file, registers them with every [`reporter::Reporter`], executes them (in parallel, with
//! timeouts and retries), and reduces that execution into an ordered stream of lifecycle
//! [messages](reporter::events::Message) per test. Reporters render that stream.

pub mod config;
pub mod errors;
mod helpers;
pub mod list;
pub mod output;
pub mod reporter;
pub mod runner;
pub mod source;
pub mod test_output;
mod time;

pub use runner::{RunOptions, run};
