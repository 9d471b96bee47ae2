// CCLAB: Reproducible Congestion-Control Experiments on Emulated Network Paths
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Common time reference of a running experiment.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Start instant of an experiment, captured once and shared by every component that needs to
/// compute deadlines relative to it.
///
/// Wall-clock timestamps are derived from the monotonic clock (`start_wall + elapsed`), so that
/// recorded timestamps and scheduled deadlines never disagree, even if the system clock jumps
/// during the experiment.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentClock {
    start: Instant,
    start_wall: SystemTime,
}

impl ExperimentClock {
    /// Take the current instant as the experiment start.
    pub fn start_now() -> Self {
        Self {
            start: Instant::now(),
            start_wall: SystemTime::now(),
        }
    }

    /// The (monotonic) instant at `offset` after the experiment start.
    pub fn at(&self, offset: Duration) -> Instant {
        self.start + offset
    }

    /// Time passed since the experiment start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Wall-clock time of the experiment start.
    pub fn start_wall(&self) -> SystemTime {
        self.start_wall
    }

    /// Current wall-clock time, as seen from the experiment start.
    pub fn wall_now(&self) -> SystemTime {
        self.start_wall + self.elapsed()
    }
}
