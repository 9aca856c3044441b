// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Helpers that keep the stack moving while the messenger waits.

use core::time::Duration;

use crate::platform::{DatagramStackProvider, DelayProvider};

/// Let the stack process timers and deliver anything pending.
pub(crate) fn pump<P: DatagramStackProvider>(platform: &P) {
    platform.pump();
}

/// Sleep for `interval`, pumping the stack on either side of the sleep.
///
/// A zero interval does nothing at all.
pub(crate) fn pumped_delay<P: DatagramStackProvider + DelayProvider>(
    platform: &P,
    interval: Duration,
) {
    if interval.is_zero() {
        return;
    }
    pump(platform);
    platform.delay(interval);
    pump(platform);
}
