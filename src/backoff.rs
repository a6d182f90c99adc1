/*
 *
 *  * Copyright (c) 2025 Couchbase, Inc.
 *  *
 *  * Licensed under the Apache License, Version 2.0 (the "License");
 *  * you may not use this file except in compliance with the License.
 *  * You may obtain a copy of the License at
 *  *
 *  *    http://www.apache.org/licenses/LICENSE-2.0
 *  *
 *  * Unless required by applicable law or agreed to in writing, software
 *  * distributed under the License is distributed on an "AS IS" BASIS,
 *  * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  * See the License for the specific language governing permissions and
 *  * limitations under the License.
 *
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Stateful exponential backoff with a floor and a cap, reset on success.
///
/// Unlike a stateless calculator that takes the attempt count as an
/// argument, callers of `BackoffPolicy` drive it with `success()`/`fail()`
/// and ask `next_delay()` for the delay to use before the *next* attempt.
/// This matches how the repository's `sync()` loop and the long-poll
/// notifier's worker loop are structured: each tracks one policy instance
/// per logical retry sequence.
#[derive(Debug)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
    factor: f64,
    attempts: AtomicU32,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max,
            factor,
            attempts: AtomicU32::new(0),
        }
    }

    /// Defaults used by the remote repository's `sync()` retry budget: a
    /// 1 second floor and an 8 second cap.
    pub fn fetch_defaults() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(8), 2.0)
    }

    /// Builds a fetch-retry policy from the configurable `onErrorRetryInterval`
    /// base (spec.md §6): the floor is whatever the caller configured, the
    /// cap scales with it (an 8x spread, matching the 1s..8s shape of
    /// [`BackoffPolicy::fetch_defaults`]) so a larger configured base still
    /// yields a sane cap instead of retrying at the same interval forever.
    pub fn fetch_with_base(base: Duration) -> Self {
        let cap = base.saturating_mul(8).max(base);
        Self::new(base, cap, 2.0)
    }

    /// Defaults used by the long-poll notifier's reconnect loop: a 1 second
    /// floor and a 120 second cap, since a long-poll failure is expected to
    /// be rarer and potentially longer-lived than a single fetch failure.
    pub fn long_poll_defaults() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120), 2.0)
    }

    /// The delay to wait before the next attempt, given the number of
    /// consecutive failures observed so far.
    pub fn next_delay(&self) -> Duration {
        let attempts = self.attempts.load(Ordering::Acquire);
        if attempts == 0 {
            return Duration::ZERO;
        }
        self.backoff_for(attempts - 1)
    }

    /// Records a failed attempt and returns the delay to wait before retrying.
    pub fn fail(&self) -> Duration {
        let attempts = self.attempts.fetch_add(1, Ordering::AcqRel);
        self.backoff_for(attempts)
    }

    /// Resets the sequence after a successful attempt.
    pub fn success(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    fn backoff_for(&self, retry_attempts: u32) -> Duration {
        let factor = self.factor.powi(retry_attempts as i32);
        let factor_u128 = factor as u128;
        let min_millis = self.min.as_millis();

        if min_millis == 0 || u128::MAX / min_millis.max(1) < factor_u128 {
            return self.max;
        }

        let val = min_millis * factor_u128;
        if val > u64::MAX as u128 {
            return self.max;
        }

        let mut backoff = Duration::from_millis(val as u64);
        if backoff > self.max {
            backoff = self.max;
        }
        if backoff < self.min {
            backoff = self.min;
        }
        backoff
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fetch_defaults()
    }
}
