// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use owo_colors::Style;
use std::{fmt, time::Duration};

#[derive(Clone, Debug, Default)]
pub(super) struct Styles {
    pub(super) is_colorized: bool,
    pub(super) count: Style,
    pub(super) pass: Style,
    pub(super) retry: Style,
    pub(super) fail: Style,
    pub(super) suite: Style,
    pub(super) slow: Style,
    pub(super) trace: Style,
}

impl Styles {
    pub(super) fn colorize(&mut self) {
        self.is_colorized = true;
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.retry = Style::new().magenta().bold();
        self.fail = Style::new().red().bold();
        self.suite = Style::new().bold();
        self.slow = Style::new().yellow();
        self.trace = Style::new().red();
    }
}

/// Displays an elapsed run time: milliseconds below a second, seconds with two decimals above.
pub(super) struct DisplayElapsed(pub(super) Duration);

impl fmt::Display for DisplayElapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis < 1000 {
            write!(f, "{millis}ms")
        } else {
            write!(f, "{:.2}s", self.0.as_secs_f64())
        }
    }
}

/// Writes `indent` before every line of `text`.
pub(super) fn indent_lines(out: &mut String, text: &str, indent: &str) {
    for line in text.lines() {
        out.push_str(indent);
        out.push_str(line);
        out.push('\n');
    }
}
