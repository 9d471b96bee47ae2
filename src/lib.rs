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
//! Reproducible congestion-control experiments on emulated network paths.
//!
//! An experiment runs a set of flows (sender/receiver process pairs) over a bottleneck link whose
//! conditions change on a schedule. [`matrix`] expands configurations into experiments,
//! [`orchestrator`] runs one of them, and [`emulation`] abstracts the network it runs on.

pub mod clock;
pub mod emulation;
pub mod events;
pub mod flow;
pub mod link;
pub mod matrix;
pub mod orchestrator;
pub mod util;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        emulation::{EmulationProfile, LocalSubstrate, NetnsSubstrate, Substrate, TopologyHandle},
        flow::{FlowDescriptor, FlowReport, FlowSpec, FlowSupervisor},
        link::{LinkCondition, LinkScheduleRunner},
        matrix::{ExperimentDescriptor, ExperimentMatrixBuilder, MatrixConfig},
        orchestrator::{ExperimentOrchestrator, ExperimentRecord, ExperimentState, RunOutcome},
    };
}
