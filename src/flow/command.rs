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
//! Generic traffic generator, given as literal server and client command lines.

use std::{net::IpAddr, path::Path};

use serde::{Deserialize, Serialize};

use super::{fill_template, CommandSpec, FlowSpec};

/// Server and client argv templates. Every argument may contain the placeholders `{addr}`,
/// `{port}` and `{log_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFlow {
    pub server: Vec<String>,
    pub client: Vec<String>,
}

impl CommandFlow {
    fn build(template: &[String], addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        let mut argv = template
            .iter()
            .map(|arg| fill_template(arg, addr, port, log_dir));
        let program = argv.next().unwrap_or_else(|| "true".to_string());
        CommandSpec::new(program).args(argv)
    }
}

#[async_trait::async_trait]
impl FlowSpec for CommandFlow {
    fn name(&self) -> &'static str {
        "command"
    }

    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        Self::build(&self.server, addr, port, log_dir)
    }

    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        Self::build(&self.client, addr, port, log_dir)
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
