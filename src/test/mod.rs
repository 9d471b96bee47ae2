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
//! Shared fixtures for the unit tests and the experiment scenarios.
//!
//! Tests that spawn real processes run in real time with short durations. Tests with a paused
//! clock only use flows whose binaries do not exist, so no process IO lets the clock run ahead.

use std::{
    net::IpAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{process::Command, time::Instant};

use crate::{
    emulation::{
        EmulationProfile, LocalSubstrate, ShapingMode, Substrate, SubstrateError, TopologyHandle,
    },
    flow::{command::CommandFlow, CommandSpec, FlowDescriptor, FlowError, FlowSpec, QualityMetrics},
    link::LinkCondition,
    matrix::ExperimentDescriptor,
};

mod scenarios;

/// Link condition starting `offset` seconds after the experiment start, with no loss, no delay
/// and a latency budget of 300ms.
pub fn condition(offset: u64, bandwidth: u64) -> LinkCondition {
    LinkCondition {
        offset: Duration::from_secs(offset),
        bandwidth,
        loss: 0.0,
        delay: Duration::ZERO,
        latency: Duration::from_millis(300),
    }
}

#[derive(Debug, Clone)]
pub struct ShapingCall {
    pub iface: String,
    pub bandwidth: u64,
    pub mode: ShapingMode,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct CommandCall {
    pub node: String,
    pub command: String,
    pub at: Instant,
}

/// Local substrate with a two-sided bottleneck that records every call.
pub struct RecordingSubstrate {
    inner: LocalSubstrate,
    fail_shaping: Option<u64>,
    fail_create: bool,
    shaping: Mutex<Vec<ShapingCall>>,
    commands: Mutex<Vec<CommandCall>>,
    teardowns: AtomicUsize,
}

impl Default for RecordingSubstrate {
    fn default() -> Self {
        Self {
            inner: LocalSubstrate::with_bottleneck(["left-bn", "right-bn"]),
            fail_shaping: None,
            fail_create: false,
            shaping: Default::default(),
            commands: Default::default(),
            teardowns: AtomicUsize::new(0),
        }
    }
}

impl RecordingSubstrate {
    /// Reject every shaping request with the given bandwidth.
    pub fn fail_shaping_for(mut self, bandwidth: u64) -> Self {
        self.fail_shaping = Some(bandwidth);
        self
    }

    /// Fail to create any topology.
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub async fn create(&self, num_pairs: usize) -> TopologyHandle {
        self.inner.topology(num_pairs)
    }

    pub fn shaping_calls(&self) -> Vec<ShapingCall> {
        self.shaping.lock().unwrap().clone()
    }

    pub fn command_calls(&self) -> Vec<CommandCall> {
        self.commands.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Substrate for RecordingSubstrate {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn create_topology(
        &self,
        num_pairs: usize,
        dir: &Path,
    ) -> Result<TopologyHandle, SubstrateError> {
        if self.fail_create {
            return Err(SubstrateError::Topology("injected failure".to_string()));
        }
        self.inner.create_topology(num_pairs, dir).await
    }

    async fn apply_link_shaping(
        &self,
        topo: &TopologyHandle,
        iface: &str,
        condition: &LinkCondition,
        mode: ShapingMode,
    ) -> Result<(), SubstrateError> {
        self.shaping.lock().unwrap().push(ShapingCall {
            iface: iface.to_string(),
            bandwidth: condition.bandwidth,
            mode,
            at: Instant::now(),
        });
        if self.fail_shaping == Some(condition.bandwidth) {
            return Err(SubstrateError::Io(
                "tc".to_string(),
                std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
            ));
        }
        self.inner
            .apply_link_shaping(topo, iface, condition, mode)
            .await
    }

    fn node_command(
        &self,
        topo: &TopologyHandle,
        node: &str,
        cmd: &CommandSpec,
    ) -> Result<Command, SubstrateError> {
        self.commands.lock().unwrap().push(CommandCall {
            node: node.to_string(),
            command: cmd.to_string(),
            at: Instant::now(),
        });
        self.inner.node_command(topo, node, cmd)
    }

    async fn teardown_topology(&self, topo: &TopologyHandle) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown_topology(topo).await
    }
}

/// Flow `id` on the default host pair, running the two shell scripts, logging into `dir`.
pub fn shell_flow(id: usize, dir: &Path, server: &str, client: &str) -> FlowDescriptor {
    let sh = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    FlowDescriptor {
        id,
        sender_node: TopologyHandle::sender_node(id),
        receiver_node: TopologyHandle::receiver_node(id),
        start_offset: Duration::ZERO,
        log_dir: dir.to_path_buf(),
        spec: Arc::new(CommandFlow {
            server: sh(server),
            client: sh(client),
        }),
    }
}

/// Flow whose processes cannot be launched, because their binaries do not exist.
pub fn missing_flow(id: usize, dir: &Path, start_offset: Duration) -> FlowDescriptor {
    FlowDescriptor {
        start_offset,
        spec: Arc::new(CommandFlow {
            server: vec!["/nonexistent/cclab-server".to_string()],
            client: vec!["/nonexistent/cclab-client".to_string()],
        }),
        ..shell_flow(id, &dir.join(id.to_string()), "", "")
    }
}

/// Wraps another flow and counts how often it was cleaned up.
#[derive(Debug)]
pub struct CountingFlow {
    pub inner: Arc<dyn FlowSpec>,
    pub cleanups: Arc<AtomicUsize>,
}

impl CountingFlow {
    /// Wrap the specification of `flow`, returning the counter.
    pub fn wrap(flow: &mut FlowDescriptor) -> Arc<AtomicUsize> {
        let cleanups = Arc::new(AtomicUsize::new(0));
        flow.spec = Arc::new(CountingFlow {
            inner: flow.spec.clone(),
            cleanups: cleanups.clone(),
        });
        cleanups
    }
}

#[async_trait::async_trait]
impl FlowSpec for CountingFlow {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        self.inner.server_command(addr, port, log_dir)
    }

    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        self.inner.client_command(addr, port, log_dir)
    }

    fn describe(&self) -> serde_json::Value {
        self.inner.describe()
    }

    async fn cleanup(&self, _log_dir: &Path) -> Result<Option<QualityMetrics>, FlowError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(Some(QualityMetrics {
            ssim: Some(1.0),
            psnr: Some(f64::INFINITY),
        }))
    }
}

/// Experiment in `dir` with the given runtime (in seconds), link schedule and flows.
pub fn experiment(
    dir: &Path,
    runtime: u64,
    conditions: Vec<LinkCondition>,
    flows: Vec<FlowDescriptor>,
) -> ExperimentDescriptor {
    ExperimentDescriptor {
        id: "0/e-0".to_string(),
        dir: dir.to_path_buf(),
        emulation: EmulationProfile {
            runtime: Duration::from_secs(runtime),
            conditions,
            capture: false,
        },
        flows,
    }
}
