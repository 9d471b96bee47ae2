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
//! Substrate without emulation: every node is the local host and shaping is only logged.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

use tokio::process::Command;

use super::{ShapingMode, Substrate, SubstrateError, TopologyHandle};
use crate::{flow::CommandSpec, link::LinkCondition};

/// Runs all processes directly on the local host, without touching the network configuration.
/// Useful for dry runs of a configuration and for testing.
#[derive(Debug, Clone)]
pub struct LocalSubstrate {
    bottleneck: Vec<String>,
}

impl Default for LocalSubstrate {
    fn default() -> Self {
        Self {
            bottleneck: vec!["lo".to_string()],
        }
    }
}

impl LocalSubstrate {
    /// Use the given (virtual) interface names as the two ends of the bottleneck.
    pub fn with_bottleneck(bottleneck: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            bottleneck: bottleneck.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the topology handle synchronously.
    pub fn topology(&self, num_pairs: usize) -> TopologyHandle {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let nodes: BTreeMap<String, IpAddr> = (0..num_pairs)
            .flat_map(|i| [TopologyHandle::sender_node(i), TopologyHandle::receiver_node(i)])
            .map(|node| (node, localhost))
            .collect();
        TopologyHandle {
            name: format!("local-{num_pairs}"),
            nodes,
            bottleneck: self.bottleneck.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Substrate for LocalSubstrate {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_topology(
        &self,
        num_pairs: usize,
        _dir: &Path,
    ) -> Result<TopologyHandle, SubstrateError> {
        Ok(self.topology(num_pairs))
    }

    async fn apply_link_shaping(
        &self,
        topo: &TopologyHandle,
        iface: &str,
        condition: &LinkCondition,
        mode: ShapingMode,
    ) -> Result<(), SubstrateError> {
        if !topo.bottleneck.iter().any(|x| x == iface) {
            return Err(SubstrateError::UnknownInterface(iface.to_string()));
        }
        log::debug!(
            "[local] ignoring {mode} shaping of {iface}: {} bit/s",
            condition.bandwidth
        );
        Ok(())
    }

    fn node_command(
        &self,
        topo: &TopologyHandle,
        node: &str,
        cmd: &CommandSpec,
    ) -> Result<Command, SubstrateError> {
        if !topo.nodes.contains_key(node) {
            return Err(SubstrateError::UnknownNode(node.to_string()));
        }
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        Ok(command)
    }

    async fn teardown_topology(&self, topo: &TopologyHandle) {
        log::trace!("[local] nothing to tear down for {}", topo.name);
    }
}
