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
//! Flows: one sender/receiver process pair per flow, the capability set each flow kind
//! implements, and the supervisor that owns the processes of one flow at runtime.

use std::{
    fmt::{Debug, Display},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::emulation::SubstrateError;

pub mod command;
pub mod iperf3;
pub mod pion_abr;
pub mod quality;
pub mod rtp_over_quic;
pub mod supervisor;

pub use quality::QualityMetrics;
pub use supervisor::{EndpointReport, FlowReport, FlowSupervisor};

/// Listen port of flow `0`. Flow `i` uses `BASE_PORT + i`.
pub const BASE_PORT: u16 = 4242;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Cannot resolve the address of {0}: {1}")]
    Address(String, SubstrateError),
    #[error("Cannot prepare the command on {0}: {1}")]
    Command(String, SubstrateError),
    #[error("Cannot spawn `{0}`: {1}")]
    Spawn(String, std::io::Error),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot serialize: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{0}` failed: {1}")]
    Tool(String, String),
}

/// An executable together with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value` if `cond` holds.
    pub fn flag_if(self, cond: bool, flag: &str, value: impl Into<String>) -> Self {
        if cond {
            self.arg(flag).arg(value)
        } else {
            self
        }
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.args.iter() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Capabilities of one flow kind. The orchestrator and the supervisor only depend on this trait.
#[async_trait::async_trait]
pub trait FlowSpec: Debug + Send + Sync {
    /// Name of the flow kind.
    fn name(&self) -> &'static str;

    /// Command of the receiver-side process, listening on `addr:port`.
    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec;

    /// Command of the sender-side process, connecting to the server at `addr:port`.
    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec;

    /// Resolved parameters of this flow, for the experiment record.
    fn describe(&self) -> serde_json::Value;

    /// Post-processing after a completed experiment. Returns the derived quality metrics, if the
    /// flow kind has any.
    async fn cleanup(&self, _log_dir: &Path) -> Result<Option<QualityMetrics>, FlowError> {
        Ok(None)
    }
}

/// One fully parameterized flow of an experiment.
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    /// Index of the flow inside its experiment
    pub id: usize,
    pub sender_node: String,
    pub receiver_node: String,
    /// Start of the sender process, relative to the experiment start
    pub start_offset: Duration,
    /// Directory for the logs and artifacts of this flow
    pub log_dir: PathBuf,
    pub spec: Arc<dyn FlowSpec>,
}

impl FlowDescriptor {
    pub fn port(&self) -> u16 {
        BASE_PORT + self.id as u16
    }

    /// Entry of this flow in the experiment record.
    pub fn describe(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "kind": self.spec.name(),
            "sender_node": self.sender_node,
            "receiver_node": self.receiver_node,
            "start_offset": self.start_offset.as_secs_f64(),
            "log_dir": self.log_dir,
            "config": self.spec.describe(),
        })
    }
}

/// Replace the `{addr}`, `{port}` and `{log_dir}` placeholders in a template argument.
pub(crate) fn fill_template(template: &str, addr: IpAddr, port: u16, log_dir: &Path) -> String {
    template
        .replace("{addr}", &addr.to_string())
        .replace("{port}", &port.to_string())
        .replace("{log_dir}", &log_dir.to_string_lossy())
}

/// `path` inside `log_dir`, as a string argument.
pub(crate) fn in_dir(log_dir: &Path, file: impl AsRef<Path>) -> String {
    log_dir.join(file).to_string_lossy().to_string()
}
