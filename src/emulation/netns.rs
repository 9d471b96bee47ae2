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
//! Dumbbell topology built from Linux network namespaces, bridges and `tc` qdiscs.
//!
//! ```text
//!  l0 ──┐                              ┌── r0
//!  l1 ──┤ {p}-ls ═ {p}-lb ── {p}-rb ═ {p}-rs ├── r1
//!  ...──┘      (bottleneck, shaped on both ends)     └── ...
//! ```
//!
//! Every host lives in its own namespace `{p}-l{i}` / `{p}-r{i}`, connected to its bridge through a
//! veth pair. All hosts share the subnet `10.0.0.0/16`. Requires root privileges.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    process::Stdio,
};

use itertools::Itertools;
use tokio::process::Command;

use super::{ShapingMode, Substrate, SubstrateError, TopologyHandle};
use crate::{flow::CommandSpec, link::LinkCondition};

/// Burst size of the token bucket filter, in bytes.
const TBF_BURST: u32 = 15_000;

/// Snap length of captured packets.
const CAPTURE_SNAPLEN: u32 = 88;

/// Maximum number of host pairs (limited by the addressing scheme).
const MAX_PAIRS: usize = 254;

#[derive(Debug, Clone)]
pub struct NetnsSubstrate {
    prefix: String,
}

impl Default for NetnsSubstrate {
    fn default() -> Self {
        Self::new("cc")
    }
}

impl NetnsSubstrate {
    /// Create a substrate whose namespaces and links are all named with `prefix`. The prefix must
    /// be short, as interface names are limited to 15 characters.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn namespace(&self, node: &str) -> String {
        format!("{}-{node}", self.prefix)
    }

    fn bridges(&self) -> [String; 2] {
        [format!("{}-ls", self.prefix), format!("{}-rs", self.prefix)]
    }

    fn bottleneck(&self) -> [String; 2] {
        [format!("{}-lb", self.prefix), format!("{}-rb", self.prefix)]
    }

    fn hosts(num_pairs: usize) -> impl Iterator<Item = (String, usize, Ipv4Addr)> {
        (0..num_pairs).flat_map(|i| {
            [
                (TopologyHandle::sender_node(i), 0, Ipv4Addr::new(10, 0, 0, i as u8 + 1)),
                (TopologyHandle::receiver_node(i), 1, Ipv4Addr::new(10, 0, 1, i as u8 + 1)),
            ]
        })
    }

    async fn build(&self, num_pairs: usize) -> Result<TopologyHandle, SubstrateError> {
        let bridges = self.bridges();
        let [left, right] = self.bottleneck();

        for bridge in bridges.iter() {
            ip(&["link", "add", bridge, "type", "bridge"]).await?;
            ip(&["link", "set", bridge, "up"]).await?;
        }
        ip(&["link", "add", &left, "type", "veth", "peer", "name", &right]).await?;
        for (iface, bridge) in [&left, &right].into_iter().zip(bridges.iter()) {
            ip(&["link", "set", iface, "master", bridge]).await?;
            ip(&["link", "set", iface, "up"]).await?;
        }

        let mut nodes = BTreeMap::new();
        for (node, side, addr) in Self::hosts(num_pairs) {
            let ns = self.namespace(&node);
            let outer = format!("{}{node}", self.prefix);
            let inner = format!("{outer}h");
            ip(&["netns", "add", &ns]).await?;
            ip(&["link", "add", &outer, "type", "veth", "peer", "name", &inner]).await?;
            ip(&["link", "set", &inner, "netns", &ns]).await?;
            ip(&["-n", &ns, "link", "set", &inner, "name", "eth0"]).await?;
            ip(&["-n", &ns, "addr", "add", &format!("{addr}/16"), "dev", "eth0"]).await?;
            ip(&["-n", &ns, "link", "set", "eth0", "up"]).await?;
            ip(&["-n", &ns, "link", "set", "lo", "up"]).await?;
            ip(&["link", "set", &outer, "master", &bridges[side]]).await?;
            ip(&["link", "set", &outer, "up"]).await?;
            nodes.insert(node, IpAddr::V4(addr));
        }

        Ok(TopologyHandle {
            name: format!("{}-dumbbell-{num_pairs}", self.prefix),
            nodes,
            bottleneck: vec![left, right],
        })
    }

    /// Remove all namespaces and links that carry the prefix of this substrate. Errors are
    /// ignored, as parts of the topology may not exist.
    async fn remove(&self, num_pairs: usize) {
        for (node, _, _) in Self::hosts(num_pairs) {
            // deleting the namespace also removes the veth pair
            let _ = ip(&["netns", "del", &self.namespace(&node)]).await;
        }
        let [left, _] = self.bottleneck();
        let _ = ip(&["link", "del", &left]).await;
        for bridge in self.bridges() {
            let _ = ip(&["link", "del", &bridge]).await;
        }
    }
}

/// The two `tc` invocations that install (or change) a token bucket filter with a `netem` child.
pub fn tc_commands(iface: &str, condition: &LinkCondition, mode: ShapingMode) -> [Vec<String>; 2] {
    let verb = match mode {
        ShapingMode::Initial => "add",
        ShapingMode::Update => "change",
    };
    let tbf = format!(
        "qdisc {verb} dev {iface} root handle 1: tbf rate {}bit burst {TBF_BURST} latency {}ms",
        condition.bandwidth,
        condition.latency.as_millis(),
    );
    let netem = format!(
        "qdisc {verb} dev {iface} parent 1: handle 2: netem delay {}ms loss {}%",
        condition.delay.as_millis(),
        condition.loss * 100.0,
    );
    [tbf, netem].map(|cmd| cmd.split(' ').map(String::from).collect())
}

async fn ip(args: &[&str]) -> Result<(), SubstrateError> {
    run("ip", args).await
}

async fn run(program: &str, args: &[impl AsRef<str>]) -> Result<(), SubstrateError> {
    let cmd = format!("{program} {}", args.iter().map(|a| a.as_ref()).join(" "));
    log::trace!("[netns] executing: {cmd}");
    let output = Command::new(program)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SubstrateError::Io(cmd.clone(), e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SubstrateError::Command {
            cmd,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Substrate for NetnsSubstrate {
    fn name(&self) -> &'static str {
        "netns"
    }

    async fn create_topology(
        &self,
        num_pairs: usize,
        _dir: &Path,
    ) -> Result<TopologyHandle, SubstrateError> {
        if num_pairs > MAX_PAIRS {
            return Err(SubstrateError::Topology(format!(
                "at most {MAX_PAIRS} host pairs are supported, got {num_pairs}"
            )));
        }
        // start from a clean slate in case a previous run was killed
        self.remove(num_pairs.max(1)).await;
        log::debug!("[netns] creating dumbbell topology with {num_pairs} host pairs");
        match self.build(num_pairs).await {
            Ok(topo) => Ok(topo),
            Err(e) => {
                log::error!("[netns] cannot create the topology: {e}");
                self.remove(num_pairs).await;
                Err(e)
            }
        }
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
        for args in tc_commands(iface, condition, mode) {
            run("tc", &args).await?;
        }
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
        let mut command = Command::new("ip");
        command
            .args(["netns", "exec", &self.namespace(node), &cmd.program])
            .args(&cmd.args);
        Ok(command)
    }

    fn capture_command(&self, _topo: &TopologyHandle, iface: &str, pcap: &Path) -> Option<Command> {
        let mut command = Command::new("tcpdump");
        command
            .args(["ip", "-i", iface, "-s", &CAPTURE_SNAPLEN.to_string(), "-w"])
            .arg(pcap);
        Some(command)
    }

    async fn teardown_topology(&self, topo: &TopologyHandle) {
        log::debug!("[netns] tearing down {}", topo.name);
        self.remove(topo.nodes.len() / 2).await;
    }
}
