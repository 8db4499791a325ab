// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use tokio::{sync::watch, time::Instant};

/// Waits until `start` plus the current timeout, returning the timeout that expired.
///
/// The timeout is `default` unless `overrides` holds a value. Whenever the override changes, the
/// deadline is moved accordingly (possibly into the past, in which case this returns at once).
pub(crate) async fn wait_for_deadline(
    start: Instant,
    default: Duration,
    mut overrides: watch::Receiver<Option<Duration>>,
) -> Duration {
    loop {
        let timeout = overrides.borrow_and_update().unwrap_or(default);
        let sleep = tokio::time::sleep_until(start + timeout);

        tokio::select! {
            () = sleep => return timeout,
            changed = overrides.changed() => {
                if changed.is_err() {
                    // No further overrides can arrive.
                    tokio::time::sleep_until(start + timeout).await;
                    return timeout;
                }
            }
        }
    }
}
