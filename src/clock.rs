// Copyright 2022 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::Cell;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source abstraction.  Wall time drives persisted anchors (backoff
/// expiry, ping days); monotonic time drives durations that must not jump
/// when NTP adjusts the clock.
pub trait Clock {
    fn wall_time(&self) -> SystemTime;
    /// Monotonic time since an arbitrary process-local epoch.
    fn monotonic(&self) -> Duration;
}

/// Seconds since the Unix epoch, saturating at 0 for pre-epoch times.
pub fn wall_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
pub struct FakeClock {
    wall: Cell<SystemTime>,
    mono: Cell<Duration>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(wall: SystemTime) -> Self {
        Self {
            wall: Cell::new(wall),
            mono: Cell::new(Duration::ZERO),
        }
    }

    pub fn set_wall_time(&self, t: SystemTime) {
        self.wall.set(t);
    }

    /// Advance both clocks together.
    pub fn advance(&self, d: Duration) {
        self.wall.set(self.wall.get() + d);
        self.mono.set(self.mono.get() + d);
    }

    /// Move the wall clock backward, leaving monotonic time alone.
    pub fn rewind_wall(&self, d: Duration) {
        self.wall.set(self.wall.get() - d);
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn wall_time(&self) -> SystemTime {
        self.wall.get()
    }

    fn monotonic(&self) -> Duration {
        self.mono.get()
    }
}
