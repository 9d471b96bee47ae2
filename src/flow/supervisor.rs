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
//! Runtime owner of the two processes of one flow.
//!
//! Each endpoint (server and client) runs in its own task, which launches the process, spawns one
//! drain task per output stream, and waits until the process exits or the flow is asked to stop.
//! A drain task copies every line to `{endpoint}_{stream}.log` in the flow directory and forwards
//! it to the event sink. An endpoint task only completes after both drains have read their stream
//! to the end.

use std::{
    net::IpAddr,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, SystemTime},
};

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};

use super::{CommandSpec, FlowDescriptor, FlowError, QualityMetrics};
use crate::{
    clock::ExperimentClock,
    emulation::{Substrate, TopologyHandle},
    events::{Endpoint, EventSink, EventSource, Stream},
    util::wait_until_set,
};

/// How long draining may continue after the process group was killed. Only matters for
/// processes that pass their output pipes to children outside of their process group.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// What happened to one endpoint of a flow.
#[derive(Debug)]
pub struct EndpointReport {
    pub endpoint: Endpoint,
    /// The command that was (or would have been) executed
    pub command: Option<CommandSpec>,
    /// Wall-clock time of the launch, if the process was launched
    pub launched_at: Option<SystemTime>,
    pub exit: Option<ExitStatus>,
    /// The process was killed because the flow was asked to stop
    pub killed: bool,
    /// The process exited on its own before the flow was asked to stop
    pub exited_early: bool,
    /// Number of output lines drained from stdout and stderr
    pub lines: usize,
    pub error: Option<FlowError>,
}

impl EndpointReport {
    fn new(endpoint: Endpoint, command: Option<CommandSpec>) -> Self {
        Self {
            endpoint,
            command,
            launched_at: None,
            exit: None,
            killed: false,
            exited_early: false,
            lines: 0,
            error: None,
        }
    }

    pub fn launched(&self) -> bool {
        self.launched_at.is_some()
    }
}

/// Outcome of one flow, returned by [`FlowSupervisor::join`].
#[derive(Debug)]
pub struct FlowReport {
    pub id: usize,
    pub server: EndpointReport,
    pub client: EndpointReport,
    /// Derived quality metrics, filled in by the cleanup of a completed experiment
    pub quality: Option<QualityMetrics>,
}

impl FlowReport {
    /// Whether any endpoint failed to launch, or exited early with a failure status.
    pub fn failed(&self) -> bool {
        [&self.server, &self.client].iter().any(|e| {
            e.error.is_some() || (e.exited_early && !e.exit.is_some_and(|s| s.success()))
        })
    }
}

/// Owns the process pair of one flow.
pub struct FlowSupervisor {
    flow: FlowDescriptor,
    sink: EventSink,
    stop: watch::Sender<bool>,
    server: Option<JoinHandle<EndpointReport>>,
    client: Option<JoinHandle<EndpointReport>>,
}

impl FlowSupervisor {
    pub fn new(flow: FlowDescriptor, sink: EventSink) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            flow,
            sink,
            stop,
            server: None,
            client: None,
        }
    }

    pub fn flow(&self) -> &FlowDescriptor {
        &self.flow
    }

    /// Launch the receiver-side process, listening on `addr`. Returns immediately.
    pub fn start_server(
        &mut self,
        substrate: Arc<dyn Substrate>,
        topology: Arc<TopologyHandle>,
        addr: IpAddr,
        clock: ExperimentClock,
    ) {
        let command = self
            .flow
            .spec
            .server_command(addr, self.flow.port(), &self.flow.log_dir);
        let launch = self.launch(Endpoint::Server, command, substrate, topology, clock);
        self.server = Some(tokio::spawn(launch.run(None, self.stop.subscribe())));
    }

    /// Launch the sender-side process, connecting to the server at `addr`, but not before
    /// `not_before`. Returns immediately.
    pub fn start_client(
        &mut self,
        substrate: Arc<dyn Substrate>,
        topology: Arc<TopologyHandle>,
        addr: IpAddr,
        clock: ExperimentClock,
        not_before: Instant,
    ) {
        let command = self
            .flow
            .spec
            .client_command(addr, self.flow.port(), &self.flow.log_dir);
        let launch = self.launch(Endpoint::Client, command, substrate, topology, clock);
        self.client = Some(tokio::spawn(
            launch.run(Some(not_before), self.stop.subscribe()),
        ));
    }

    /// Mark the flow as failed before any of its processes could be launched.
    pub fn reject(&mut self, error: FlowError) {
        let mut report = EndpointReport::new(Endpoint::Server, None);
        report.error = Some(error);
        self.server = Some(tokio::spawn(async move { report }));
    }

    fn launch(
        &self,
        endpoint: Endpoint,
        command: CommandSpec,
        substrate: Arc<dyn Substrate>,
        topology: Arc<TopologyHandle>,
        clock: ExperimentClock,
    ) -> Launch {
        let node = match endpoint {
            Endpoint::Server => self.flow.receiver_node.clone(),
            Endpoint::Client => self.flow.sender_node.clone(),
        };
        Launch {
            id: self.flow.id,
            endpoint,
            node,
            command,
            log_dir: self.flow.log_dir.clone(),
            substrate,
            topology,
            sink: self.sink.clone(),
            clock,
        }
    }

    /// Ask both processes to terminate. Idempotent; processes that already exited are left
    /// alone, and endpoints that were not launched yet never launch.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until both processes exited and their output is fully drained.
    pub async fn join(&mut self) -> FlowReport {
        let id = self.flow.id;
        let server = join_endpoint(id, Endpoint::Server, self.server.take()).await;
        let client = join_endpoint(id, Endpoint::Client, self.client.take()).await;
        FlowReport {
            id,
            server,
            client,
            quality: None,
        }
    }

    /// Flow-specific post-processing of a completed experiment.
    pub async fn cleanup(&self) -> Result<Option<QualityMetrics>, FlowError> {
        self.flow.spec.cleanup(&self.flow.log_dir).await
    }
}

async fn join_endpoint(
    id: usize,
    endpoint: Endpoint,
    handle: Option<JoinHandle<EndpointReport>>,
) -> EndpointReport {
    match handle {
        Some(handle) => match handle.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("[flow {id}] {endpoint} task failed: {e}");
                let mut report = EndpointReport::new(endpoint, None);
                report.error = Some(FlowError::Tool(format!("{endpoint} task"), e.to_string()));
                report
            }
        },
        None => EndpointReport::new(endpoint, None),
    }
}

/// Everything an endpoint task needs.
struct Launch {
    id: usize,
    endpoint: Endpoint,
    node: String,
    command: CommandSpec,
    log_dir: PathBuf,
    substrate: Arc<dyn Substrate>,
    topology: Arc<TopologyHandle>,
    sink: EventSink,
    clock: ExperimentClock,
}

impl Launch {
    async fn emit(&self, message: String) {
        self.sink.emit(EventSource::Flow(self.id), message).await
    }

    async fn fail(&self, mut report: EndpointReport, error: FlowError) -> EndpointReport {
        log::error!("[flow {}] {} failed to launch: {error}", self.id, self.endpoint);
        self.emit(format!("{} failed to launch: {error}", self.endpoint))
            .await;
        report.error = Some(error);
        report
    }

    async fn run(
        self,
        not_before: Option<Instant>,
        mut stop: watch::Receiver<bool>,
    ) -> EndpointReport {
        let endpoint = self.endpoint;
        let mut report = EndpointReport::new(endpoint, Some(self.command.clone()));

        if let Some(at) = not_before {
            tokio::select! {
                _ = sleep_until(at) => {}
                _ = wait_until_set(&mut stop) => {}
            }
        }
        if *stop.borrow() {
            log::debug!("[flow {}] stopped before the {endpoint} was launched", self.id);
            return report;
        }

        let mut command = match self
            .substrate
            .node_command(&self.topology, &self.node, &self.command)
        {
            Ok(command) => command,
            Err(e) => return self.fail(report, FlowError::Command(self.node.clone(), e)).await,
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            return self.fail(report, FlowError::Io(e)).await;
        }

        self.emit(format!("{endpoint} command: {}", self.command)).await;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so that the whole tree can be killed at once
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = FlowError::Spawn(self.command.program.clone(), e);
                return self.fail(report, error).await;
            }
        };
        let pid = child.id();
        report.launched_at = Some(self.clock.wall_now());
        log::debug!("[flow {}] {endpoint} running on {} (pid {pid:?})", self.id, self.node);

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(self.drain(stdout, Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(self.drain(stderr, Stream::Stderr));
        }
        let aborts: Vec<_> = drains.iter().map(|d| d.abort_handle()).collect();

        let mut killed = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = wait_until_set(&mut stop) => {
                kill_group(pid);
                let _ = child.start_kill();
                killed = true;
                child.wait().await
            }
        };
        match status {
            Ok(status) => {
                report.exit = Some(status);
                if killed {
                    self.emit(format!("{endpoint} stopped")).await;
                } else {
                    report.exited_early = true;
                    log::warn!("[flow {}] {endpoint} exited early with {status}", self.id);
                    self.emit(format!("{endpoint} exited early with {status}"))
                        .await;
                }
            }
            Err(e) => log::error!("[flow {}] cannot wait for the {endpoint}: {e}", self.id),
        }
        report.killed = killed;

        let drained = async {
            let mut lines = 0;
            for drain in drains {
                lines += drain.await.unwrap_or_default();
            }
            lines
        };
        tokio::pin!(drained);
        let lines = if killed {
            timeout(DRAIN_GRACE, &mut drained).await.ok()
        } else {
            // the process exited, but its children may still hold the pipes
            tokio::select! {
                biased;
                lines = &mut drained => Some(lines),
                _ = wait_until_set(&mut stop) => {
                    kill_group(pid);
                    timeout(DRAIN_GRACE, &mut drained).await.ok()
                }
            }
        };
        match lines {
            Some(lines) => report.lines = lines,
            None => {
                log::warn!(
                    "[flow {}] output of the {endpoint} still open after {DRAIN_GRACE:?}, giving up",
                    self.id
                );
                aborts.iter().for_each(|a| a.abort());
            }
        }
        report
    }

    fn drain(&self, reader: impl AsyncRead + Unpin + Send + 'static, stream: Stream) -> JoinHandle<usize> {
        let path = self.log_dir.join(format!("{}_{stream}.log", self.endpoint));
        let source = EventSource::Output(self.id, self.endpoint, stream);
        let sink = self.sink.clone();
        tokio::spawn(drain(reader, path, source, sink))
    }
}

/// Copy every line of `reader` to the file at `path` and to the sink, until the end of the
/// stream. Returns the number of lines.
async fn drain(
    reader: impl AsyncRead + Unpin,
    path: PathBuf,
    source: EventSource,
    sink: EventSink,
) -> usize {
    let mut file = match File::create(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            log::error!("[{source}] cannot create {}: {e}", path.to_string_lossy());
            None
        }
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(&buf).await {
                        log::error!("[{source}] cannot write {}: {e}", path.to_string_lossy());
                        file = None;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                sink.emit(source, line.trim_end()).await;
                lines += 1;
            }
            Err(e) => {
                log::warn!("[{source}] stopped reading: {e}");
                break;
            }
        }
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
    lines
}

/// Kill the process group led by `pid`. Errors (e.g., the group is already gone) are ignored.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::trace!("cannot kill process group {pid}: {e}");
    }
}
