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
//! Adaptive-bitrate video flow of the Pion bandwidth-estimation test tool.

use std::{net::IpAddr, path::Path};

use serde::{Deserialize, Serialize};

use super::{in_dir, CommandSpec, FlowSpec};

fn default_cmd() -> String {
    "./third_party/bwe-test-pion/bwe-test-pion".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PionAbr {
    #[serde(default = "default_cmd")]
    pub cmd: String,
}

impl Default for PionAbr {
    fn default() -> Self {
        Self { cmd: default_cmd() }
    }
}

impl PionAbr {
    fn command(&self, mode: &str, addr: IpAddr, port: u16) -> CommandSpec {
        CommandSpec::new(&self.cmd).args([
            "-mode".to_string(),
            mode.to_string(),
            "-addr".to_string(),
            format!("{addr}:{port}"),
        ])
    }
}

#[async_trait::async_trait]
impl FlowSpec for PionAbr {
    fn name(&self) -> &'static str {
        "pion_abr"
    }

    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        self.command("receiver", addr, port).args([
            "-rtcp-inbound-log".to_string(),
            in_dir(log_dir, "receiver_inbound.rtcp"),
            "-rtcp-outbound-log".to_string(),
            in_dir(log_dir, "receiver_outbound.rtcp"),
            "-rtp-log".to_string(),
            in_dir(log_dir, "receiver.rtp"),
        ])
    }

    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        self.command("sender", addr, port).args([
            "-rtcp-inbound-log".to_string(),
            in_dir(log_dir, "sender_inbound.rtcp"),
            "-rtcp-outbound-log".to_string(),
            in_dir(log_dir, "sender_outbound.rtcp"),
            "-rtp-log".to_string(),
            in_dir(log_dir, "sender.rtp"),
            "-cc-log".to_string(),
            in_dir(log_dir, "cc.gcc"),
        ])
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "name": "bwe-test-pion-abr", "cmd": self.cmd })
    }
}
