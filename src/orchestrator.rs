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
//! Runs one experiment: network, link schedule, flows, deadline, and an ordered teardown.
//!
//! ```text
//! Idle -> NetworkUp -> FlowsStarting -> Running -> Draining -> TornDown
//!              \______________\______________\-> Aborted -/
//! ```
//!
//! Draining (stop every flow, close the link schedule, join every flow) and the release of the
//! topology happen on every path once the network is up. Flow cleanup and the experiment record
//! only happen if the run completed.

use std::{
    fmt::Display,
    fs,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, SystemTime},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::Child,
    time::{sleep_until, timeout},
};

use cclab_utils::other::unix_secs_f64;

use crate::{
    clock::ExperimentClock,
    emulation::{EmulationProfile, Substrate, SubstrateError, TopologyHandle},
    events::{Event, EventLogger, EventSink, EventSource, EVENT_BUFFER},
    flow::{FlowError, FlowReport, FlowSupervisor},
    link::{LinkScheduleHandle, LinkScheduleRunner, LinkScheduleState},
    matrix::ExperimentDescriptor,
};

/// How long a packet capture may take to flush its buffers after it was interrupted.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExperimentState {
    Idle,
    NetworkUp,
    FlowsStarting,
    Running,
    Draining,
    TornDown,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The operator cancelled the experiment
    Interrupted,
    /// Preparing the experiment failed after the network was up
    Setup(String),
    /// A task of the experiment panicked
    Panicked(String),
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Interrupted => write!(f, "interrupted"),
            AbortReason::Setup(e) => write!(f, "setup failed: {e}"),
            AbortReason::Panicked(e) => write!(f, "panicked: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted(AbortReason),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot create the topology: {0}")]
    Topology(SubstrateError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot serialize the experiment record: {0}")]
    Json(#[from] serde_json::Error),
}

/// What happened, and when, in a completed experiment. Stored as `config.json` in the
/// experiment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Seconds since the Unix epoch
    pub start_time: f64,
    /// Seconds since the Unix epoch
    pub end_time: f64,
    pub emulation: serde_json::Value,
    pub flows: Vec<serde_json::Value>,
}

impl ExperimentRecord {
    pub const FILE: &'static str = "config.json";

    pub fn new(
        start: SystemTime,
        end: SystemTime,
        emulation: &EmulationProfile,
        flows: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            start_time: unix_secs_f64(start),
            end_time: unix_secs_f64(end),
            emulation: emulation.describe(),
            flows,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, OrchestratorError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self, OrchestratorError> {
        let content = fs::read_to_string(dir.join(Self::FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Observed duration of the experiment, in seconds.
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Result of [`ExperimentOrchestrator::run`].
#[derive(Debug)]
pub struct RunReport {
    pub id: String,
    pub outcome: RunOutcome,
    /// Every state the experiment went through, starting with [`ExperimentState::Idle`]
    pub transitions: Vec<ExperimentState>,
    /// The written record, if the experiment completed
    pub record: Option<ExperimentRecord>,
    pub flows: Vec<FlowReport>,
    /// The progress events, if the history was requested
    pub events: Vec<Event>,
    /// Final state of the link schedule
    pub link: Option<LinkScheduleState>,
}

impl RunReport {
    pub fn final_state(&self) -> ExperimentState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(ExperimentState::Idle)
    }
}

/// A packet capture on one interface.
struct Capture {
    iface: String,
    child: Child,
}

/// Everything the experiment acquired after the network came up.
#[derive(Default)]
struct Acquired {
    clock: Option<ExperimentClock>,
    schedule: Option<LinkScheduleHandle>,
    captures: Vec<Capture>,
    supervisors: Vec<FlowSupervisor>,
    end: Option<SystemTime>,
}

/// Runs exactly one experiment.
pub struct ExperimentOrchestrator {
    descriptor: ExperimentDescriptor,
    substrate: Arc<dyn Substrate>,
    keep_events: bool,
    transitions: Vec<ExperimentState>,
}

impl ExperimentOrchestrator {
    pub fn new(descriptor: ExperimentDescriptor, substrate: Arc<dyn Substrate>) -> Self {
        Self {
            descriptor,
            substrate,
            keep_events: false,
            transitions: vec![ExperimentState::Idle],
        }
    }

    /// Keep all progress events and return them in the [`RunReport`].
    pub fn with_event_history(mut self) -> Self {
        self.keep_events = true;
        self
    }

    pub fn state(&self) -> ExperimentState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(ExperimentState::Idle)
    }

    async fn transition(&mut self, to: ExperimentState, sink: &EventSink) {
        log::debug!(
            "[orchestrator] {}: {} -> {to}",
            self.descriptor.id,
            self.state()
        );
        self.transitions.push(to);
        sink.emit(EventSource::Orchestrator, format!("state: {to}"))
            .await;
    }

    /// Run the experiment until its runtime elapsed, or until `interrupt` completes.
    ///
    /// Only a failure to create the topology is returned as an error. Every other failure is
    /// contained: failing flows and link updates are reported, and setup errors or an interrupt
    /// abort the experiment, which is still drained and torn down.
    pub async fn run(
        mut self,
        interrupt: impl Future<Output = ()>,
    ) -> Result<RunReport, OrchestratorError> {
        let (sink, rx) = EventSink::channel(EVENT_BUFFER);
        let logger = EventLogger::spawn(rx, self.keep_events);
        let id = self.descriptor.id.clone();
        log::info!("[orchestrator] running {}", self.descriptor);

        let topology = match self
            .substrate
            .create_topology(self.descriptor.flows.len(), &self.descriptor.dir)
            .await
        {
            Ok(topology) => Arc::new(topology),
            Err(e) => {
                log::error!("[orchestrator] {id}: cannot create the topology: {e}");
                sink.emit(
                    EventSource::Orchestrator,
                    format!("cannot create the topology: {e}"),
                )
                .await;
                self.transition(ExperimentState::Aborted, &sink).await;
                drop(sink);
                logger.finish().await;
                return Err(OrchestratorError::Topology(e));
            }
        };
        self.transition(ExperimentState::NetworkUp, &sink).await;

        let mut acquired = Acquired::default();
        let mut outcome = match self
            .start_and_wait(&topology, &sink, &mut acquired, interrupt)
            .await
        {
            Ok(()) => RunOutcome::Completed,
            Err(reason) => {
                log::warn!("[orchestrator] {id}: aborted, {reason}");
                sink.emit(EventSource::Orchestrator, format!("aborted: {reason}"))
                    .await;
                self.transition(ExperimentState::Aborted, &sink).await;
                RunOutcome::Aborted(reason)
            }
        };

        // draining happens on every path
        self.transition(ExperimentState::Draining, &sink).await;
        acquired.supervisors.iter().for_each(|s| s.request_stop());
        for capture in acquired.captures.drain(..) {
            stop_capture(capture).await;
        }
        let link = match acquired.schedule.take() {
            Some(schedule) => {
                let state = schedule.close().await;
                if state.is_none() && outcome.is_completed() {
                    outcome = RunOutcome::Aborted(AbortReason::Panicked(
                        "link schedule task".to_string(),
                    ));
                }
                state
            }
            None => None,
        };
        let mut flows = Vec::with_capacity(acquired.supervisors.len());
        for supervisor in acquired.supervisors.iter_mut() {
            flows.push(supervisor.join().await);
        }
        for report in flows.iter().filter(|r| r.failed()) {
            log::warn!("[orchestrator] {id}: flow {} failed", report.id);
        }

        let mut record = None;
        if let (RunOutcome::Completed, Some(clock), Some(end)) =
            (&outcome, acquired.clock, acquired.end)
        {
            for (supervisor, report) in acquired.supervisors.iter().zip(flows.iter_mut()) {
                match supervisor.cleanup().await {
                    Ok(quality) => report.quality = quality,
                    Err(e) => log::warn!("[flow {}] cleanup failed: {e}", report.id),
                }
            }
            let flow_records = acquired
                .supervisors
                .iter()
                .zip(flows.iter())
                .map(|(supervisor, report)| {
                    let mut value = supervisor.flow().describe();
                    if let Some(quality) = report.quality {
                        value["quality"] = serde_json::to_value(quality).unwrap_or_default();
                    }
                    value
                })
                .collect();
            let r = ExperimentRecord::new(
                clock.start_wall(),
                end,
                &self.descriptor.emulation,
                flow_records,
            );
            match r.write(&self.descriptor.dir) {
                Ok(path) => log::debug!("[orchestrator] {id}: wrote {}", path.to_string_lossy()),
                Err(e) => log::error!("[orchestrator] {id}: cannot write the record: {e}"),
            }
            record = Some(r);
        }

        self.substrate.teardown_topology(&topology).await;
        self.transition(ExperimentState::TornDown, &sink).await;
        drop(sink);
        let events = logger.finish().await;
        log::info!("[orchestrator] {id}: done ({outcome:?})");

        Ok(RunReport {
            id,
            outcome,
            transitions: self.transitions,
            record,
            flows,
            events,
            link,
        })
    }

    /// Everything between `NetworkUp` and the end of `Running`. Anything acquired is stored in
    /// `acquired`, so that it is released even if this returns early.
    async fn start_and_wait(
        &mut self,
        topology: &Arc<TopologyHandle>,
        sink: &EventSink,
        acquired: &mut Acquired,
        interrupt: impl Future<Output = ()>,
    ) -> Result<(), AbortReason> {
        let emulation = self.descriptor.emulation.clone();
        let dir = self.descriptor.dir.clone();

        let mut runner = LinkScheduleRunner::new(
            &emulation.conditions,
            EmulationProfile::history_path(&dir),
            self.substrate.clone(),
            topology.clone(),
            sink.clone(),
        )
        .map_err(|e| AbortReason::Setup(e.to_string()))?;

        tokio::pin!(interrupt);
        // the link is shaped before any flow starts
        tokio::select! {
            biased;
            _ = &mut interrupt => return Err(AbortReason::Interrupted),
            _ = runner.apply_initial() => {}
        }

        if emulation.capture {
            for iface in topology.bottleneck.iter() {
                if let Some(capture) = self.start_capture(topology, iface, &dir) {
                    acquired.captures.push(capture);
                }
            }
        }

        // no flow is launched once interrupted
        tokio::select! {
            biased;
            _ = &mut interrupt => return Err(AbortReason::Interrupted),
            _ = std::future::ready(()) => {}
        }

        let clock = ExperimentClock::start_now();
        acquired.clock = Some(clock);
        self.transition(ExperimentState::FlowsStarting, sink).await;
        acquired.schedule = Some(runner.start(clock));

        for flow in self.descriptor.flows.iter() {
            let mut supervisor = FlowSupervisor::new(flow.clone(), sink.clone());
            match self.substrate.resolve_address(topology, &flow.receiver_node) {
                Ok(addr) => {
                    supervisor.start_server(self.substrate.clone(), topology.clone(), addr, clock);
                    supervisor.start_client(
                        self.substrate.clone(),
                        topology.clone(),
                        addr,
                        clock,
                        clock.at(flow.start_offset),
                    );
                }
                Err(e) => {
                    log::error!("[flow {}] cannot resolve {}: {e}", flow.id, flow.receiver_node);
                    sink.emit(
                        EventSource::Flow(flow.id),
                        format!("cannot resolve {}: {e}", flow.receiver_node),
                    )
                    .await;
                    supervisor.reject(FlowError::Address(flow.receiver_node.clone(), e));
                }
            }
            acquired.supervisors.push(supervisor);
        }
        self.transition(ExperimentState::Running, sink).await;

        let runtime = emulation.runtime;
        let elapsed = clock.elapsed();
        if elapsed > runtime {
            log::warn!(
                "[orchestrator] {}: scheduling took {elapsed:?}, longer than the runtime of {runtime:?}",
                self.descriptor.id
            );
        }
        sink.emit(
            EventSource::Orchestrator,
            format!("running for {:?}", runtime.saturating_sub(elapsed)),
        )
        .await;

        tokio::select! {
            _ = sleep_until(clock.at(runtime)) => {
                acquired.end = Some(clock.wall_now());
                Ok(())
            }
            _ = &mut interrupt => Err(AbortReason::Interrupted),
        }
    }

    fn start_capture(&self, topology: &TopologyHandle, iface: &str, dir: &Path) -> Option<Capture> {
        let pcap = dir.join(format!("{iface}.pcap"));
        let mut command = self.substrate.capture_command(topology, iface, &pcap)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match command.spawn() {
            Ok(child) => {
                log::debug!("[orchestrator] capturing {iface} into {}", pcap.to_string_lossy());
                Some(Capture {
                    iface: iface.to_string(),
                    child,
                })
            }
            Err(e) => {
                log::error!("[orchestrator] cannot capture on {iface}: {e}");
                None
            }
        }
    }
}

/// Interrupt a capture, so that it flushes its buffers, and kill it if it does not exit in time.
async fn stop_capture(mut capture: Capture) {
    if let Some(pid) = capture.child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            log::debug!("[orchestrator] cannot interrupt the capture on {}: {e}", capture.iface);
        }
    }
    if timeout(CAPTURE_GRACE, capture.child.wait()).await.is_err() {
        log::warn!("[orchestrator] capture on {} did not stop, killing it", capture.iface);
        let _ = capture.child.kill().await;
    }
}
