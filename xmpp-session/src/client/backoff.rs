// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;

/// Delay policy between failed connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub start: Duration,

    /// Factor by which the delay grows with each consecutive failure.
    pub factor: f64,

    /// Upper bound of the delay.
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(1),
            factor: 1.2,
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Millisecond delays, for tests.
    pub fn tight() -> Self {
        Self {
            start: Duration::from_millis(10),
            factor: 2.0,
            cap: Duration::from_millis(100),
        }
    }
}

pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Delay to wait after one more failed attempt.
    pub fn next_delay(&mut self) -> Duration {
        let cap = self.config.cap;
        let next = match self.current {
            None => self.config.start,
            Some(current) => {
                let secs = current.as_secs_f64() * self.config.factor.max(1.0);
                if secs >= cap.as_secs_f64() {
                    cap
                } else {
                    Duration::try_from_secs_f64(secs).map_or(cap, |next| next.max(current))
                }
            }
        };
        let next = next.min(cap);
        self.current = Some(next);
        next
    }
}
