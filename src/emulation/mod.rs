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
//! The network-emulation substrate and the emulation profile of an experiment.
//!
//! A [`Substrate`] materializes a dumbbell topology with one host pair per flow, shapes the
//! bottleneck link, and knows how to run a command on one of its nodes. The orchestrator is the
//! only owner of the resulting [`TopologyHandle`].

use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::{flow::CommandSpec, link::LinkCondition};

pub mod local;
pub mod netns;

pub use local::LocalSubstrate;
pub use netns::NetnsSubstrate;

/// Whether shaping rules are installed for the first time, or changed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShapingMode {
    Initial,
    Update,
}

/// Materialized topology of one experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHandle {
    /// Name of the topology instance (used for logging)
    pub name: String,
    /// Address of every host node
    pub nodes: BTreeMap<String, IpAddr>,
    /// Interfaces on both ends of the bottleneck link that carry the shaping rules
    pub bottleneck: Vec<String>,
}

impl TopologyHandle {
    /// Name of the sender-side node of host pair `i`.
    pub fn sender_node(i: usize) -> String {
        format!("l{i}")
    }

    /// Name of the receiver-side node of host pair `i`.
    pub fn receiver_node(i: usize) -> String {
        format!("r{i}")
    }
}

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("Cannot execute `{0}`: {1}")]
    Io(String, std::io::Error),
    #[error("`{cmd}` failed with {status}: {stderr}")]
    Command {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),
    #[error("Cannot create a topology: {0}")]
    Topology(String),
}

#[async_trait::async_trait]
pub trait Substrate: Send + Sync {
    /// Short name of the substrate.
    fn name(&self) -> &'static str;

    /// Create hosts and links for `num_pairs` sender/receiver host pairs. `dir` is the output
    /// directory of the experiment.
    async fn create_topology(
        &self,
        num_pairs: usize,
        dir: &Path,
    ) -> Result<TopologyHandle, SubstrateError>;

    /// Address of a node in the topology.
    fn resolve_address(&self, topo: &TopologyHandle, node: &str) -> Result<IpAddr, SubstrateError> {
        topo.nodes
            .get(node)
            .copied()
            .ok_or_else(|| SubstrateError::UnknownNode(node.to_string()))
    }

    /// Apply bandwidth, loss, delay and latency budget to one interface of the topology.
    async fn apply_link_shaping(
        &self,
        topo: &TopologyHandle,
        iface: &str,
        condition: &LinkCondition,
        mode: ShapingMode,
    ) -> Result<(), SubstrateError>;

    /// Prepare a command that executes `cmd` on `node`.
    fn node_command(
        &self,
        topo: &TopologyHandle,
        node: &str,
        cmd: &CommandSpec,
    ) -> Result<Command, SubstrateError>;

    /// Prepare a packet capture on `iface`, writing to `pcap`. Substrates without capture support
    /// return `None`.
    fn capture_command(&self, _topo: &TopologyHandle, _iface: &str, _pcap: &Path) -> Option<Command> {
        None
    }

    /// Release everything the topology holds. Must not fail; problems are logged.
    async fn teardown_topology(&self, topo: &TopologyHandle);
}

/// The emulated network of one experiment: how long it runs and how the bottleneck changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationProfile {
    #[serde(with = "cclab_utils::serde::duration_secs")]
    pub runtime: Duration,
    #[serde(rename = "link_configs")]
    pub conditions: Vec<LinkCondition>,
    /// Capture packets on the bottleneck
    #[serde(default)]
    pub capture: bool,
}

impl EmulationProfile {
    /// Snapshot of the emulation parameters for the experiment record.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Path of the link-history log in the experiment directory.
    pub fn history_path(dir: &Path) -> PathBuf {
        dir.join("link.log")
    }
}
