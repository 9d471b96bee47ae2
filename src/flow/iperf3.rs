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
//! Bulk TCP flow driven by `iperf3`.

use std::{net::IpAddr, path::Path};

use serde::{Deserialize, Serialize};

use super::{in_dir, CommandSpec, FlowSpec};

fn default_cmd() -> String {
    "iperf3".to_string()
}

fn default_cc() -> Vec<String> {
    vec!["cubic".to_string()]
}

fn default_duration() -> u64 {
    60
}

/// Configuration axes of an `iperf3` flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iperf3Options {
    #[serde(default = "default_cmd")]
    pub cmd: String,
    /// One flow variant per algorithm.
    #[serde(default = "default_cc")]
    pub congestion_control_algorithm: Vec<String>,
    /// Transmit time of the client, in seconds.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

impl Iperf3Options {
    pub fn expand(&self) -> Vec<Iperf3> {
        self.congestion_control_algorithm
            .iter()
            .map(|cc| Iperf3 {
                cmd: self.cmd.clone(),
                congestion_control_algorithm: cc.clone(),
                duration: self.duration,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iperf3 {
    pub cmd: String,
    pub congestion_control_algorithm: String,
    pub duration: u64,
}

#[async_trait::async_trait]
impl FlowSpec for Iperf3 {
    fn name(&self) -> &'static str {
        "iperf3"
    }

    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.cmd).args([
            "--server".to_string(),
            "--bind".to_string(),
            addr.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--json".to_string(),
            "--logfile".to_string(),
            in_dir(log_dir, "server.iperf3"),
        ])
    }

    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.cmd).args([
            "--client".to_string(),
            addr.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--time".to_string(),
            self.duration.to_string(),
            "--version4".to_string(),
            "--linux-congestion".to_string(),
            self.congestion_control_algorithm.clone(),
            "--json".to_string(),
            "--logfile".to_string(),
            in_dir(log_dir, "client.iperf3"),
        ])
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "congestion_control_algorithm": self.congestion_control_algorithm,
            "duration": self.duration,
        })
    }
}
