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
//! Real-time video over RTP, carried by QUIC, TCP or UDP, with a pluggable RTP congestion
//! controller.

use std::{net::IpAddr, path::Path};

use itertools::iproduct;
use serde::{Deserialize, Serialize};

use super::{in_dir, quality, CommandSpec, FlowError, FlowSpec, QualityMetrics};

fn default_cmd() -> String {
    "./third_party/rtp-over-quic/rtp-over-quic".to_string()
}

fn default_output() -> String {
    "out.y4m".to_string()
}

/// Go runtime profiles that the sender or the receiver can write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profiles {
    pub cpu_profile: bool,
    pub goroutine_profile: bool,
    pub heap_profile: bool,
    pub allocs_profile: bool,
    pub block_profile: bool,
    pub mutex_profile: bool,
}

impl Profiles {
    /// Append the `--pprof-*` switches, writing profiles to `{log_dir}/{role}_{name}.pprof`.
    fn append(&self, mut cmd: CommandSpec, role: &str, log_dir: &Path) -> CommandSpec {
        for (enabled, name) in [
            (self.cpu_profile, "cpu"),
            (self.goroutine_profile, "goroutine"),
            (self.heap_profile, "heap"),
            (self.allocs_profile, "allocs"),
            (self.block_profile, "block"),
            (self.mutex_profile, "mutex"),
        ] {
            cmd = cmd.flag_if(
                enabled,
                &format!("--pprof-{name}"),
                in_dir(log_dir, format!("{role}_{name}.pprof")),
            );
        }
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_cmd")]
    pub cmd: String,
    /// Source video. An empty string lets the sender generate a test pattern.
    #[serde(default)]
    pub input: String,
    #[serde(flatten)]
    pub profiles: Profiles,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            cmd: default_cmd(),
            input: String::new(),
            profiles: Profiles::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_cmd")]
    pub cmd: String,
    /// Name of the received video, inside the flow directory.
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(flatten)]
    pub profiles: Profiles,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            cmd: default_cmd(),
            output: default_output(),
            profiles: Profiles::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpCongestionControl {
    pub rtcp_feedback: String,
    pub local_rfc8888: bool,
    pub rtp_cc: String,
}

impl Default for RtpCongestionControl {
    fn default() -> Self {
        Self {
            rtcp_feedback: "rfc8888".to_string(),
            local_rfc8888: false,
            rtp_cc: "scream".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transport {
    /// `quic`, `tcp` or `udp`
    pub protocol: String,
    /// Congestion controller of the transport (`none` for UDP)
    pub cc: String,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            protocol: "quic".to_string(),
            cc: "reno".to_string(),
        }
    }
}

/// Configuration axes of an RTP-over-QUIC flow. `codec`, `stream`, `transport` and `rtp_cc` are
/// expanded into their cross product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpOverQuicOptions {
    #[serde(default = "default_codecs")]
    pub codec: Vec<String>,
    #[serde(default = "default_stream")]
    pub stream: Vec<bool>,
    #[serde(default = "default_transports")]
    pub transport: Vec<Transport>,
    #[serde(default = "default_rtp_cc")]
    pub rtp_cc: Vec<RtpCongestionControl>,
    #[serde(default)]
    pub sender_config: SenderConfig,
    #[serde(default)]
    pub receiver_config: ReceiverConfig,
}

fn default_codecs() -> Vec<String> {
    vec!["h264".to_string()]
}

fn default_stream() -> Vec<bool> {
    vec![false]
}

fn default_transports() -> Vec<Transport> {
    vec![Transport::default()]
}

fn default_rtp_cc() -> Vec<RtpCongestionControl> {
    vec![RtpCongestionControl::default()]
}

impl RtpOverQuicOptions {
    pub fn expand(&self) -> Vec<RtpOverQuic> {
        iproduct!(
            self.codec.iter(),
            self.stream.iter(),
            self.transport.iter(),
            self.rtp_cc.iter()
        )
        .map(|(codec, stream, transport, rtp_cc)| RtpOverQuic {
            sender_config: self.sender_config.clone(),
            receiver_config: self.receiver_config.clone(),
            rtp_cc: rtp_cc.clone(),
            transport: transport.clone(),
            codec: codec.clone(),
            stream: *stream,
        })
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpOverQuic {
    pub sender_config: SenderConfig,
    pub receiver_config: ReceiverConfig,
    pub rtp_cc: RtpCongestionControl,
    pub transport: Transport,
    /// Only part of the experiment record, the sender chooses the codec itself
    pub codec: String,
    pub stream: bool,
}

#[async_trait::async_trait]
impl FlowSpec for RtpOverQuic {
    fn name(&self) -> &'static str {
        "rtp_over_quic"
    }

    fn server_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        let cmd = CommandSpec::new(&self.receiver_config.cmd).args([
            "receive".to_string(),
            "--addr".to_string(),
            format!("{addr}:{port}"),
            "--sink".to_string(),
            in_dir(log_dir, &self.receiver_config.output),
            "--rtp-dump".to_string(),
            in_dir(log_dir, "receiver_rtp.log"),
            "--rtcp-dump".to_string(),
            in_dir(log_dir, "receiver_rtcp.log"),
            "--qlog".to_string(),
            log_dir.to_string_lossy().to_string(),
            "--transport".to_string(),
            self.transport.protocol.clone(),
            "--rtcp-feedback".to_string(),
            self.rtp_cc.rtcp_feedback.clone(),
        ]);
        self.receiver_config
            .profiles
            .append(cmd, "receiver", log_dir)
    }

    fn client_command(&self, addr: IpAddr, port: u16, log_dir: &Path) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.sender_config.cmd).args([
            "send".to_string(),
            "--addr".to_string(),
            format!("{addr}:{port}"),
            "--source".to_string(),
            self.sender_config.input.clone(),
            "--rtp-dump".to_string(),
            in_dir(log_dir, "sender_rtp.log"),
            "--rtcp-dump".to_string(),
            in_dir(log_dir, "sender_rtcp.log"),
            "--cc-dump".to_string(),
            in_dir(log_dir, "cc.log"),
            "--qlog".to_string(),
            log_dir.to_string_lossy().to_string(),
            "--transport".to_string(),
            self.transport.protocol.clone(),
            "--rtp-cc".to_string(),
            self.rtp_cc.rtp_cc.clone(),
        ]);
        if self.stream {
            cmd = cmd.arg("--stream");
        }
        if self.rtp_cc.local_rfc8888 {
            cmd = cmd.arg("--local-rfc8888");
        }
        cmd = match self.transport.protocol.as_str() {
            "quic" => cmd.arg("--quic-cc").arg(&self.transport.cc),
            "tcp" => cmd.arg("--tcp-congestion").arg(&self.transport.cc),
            _ => cmd,
        };
        self.sender_config.profiles.append(cmd, "sender", log_dir)
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Compare the sent and the received video.
    async fn cleanup(&self, log_dir: &Path) -> Result<Option<QualityMetrics>, FlowError> {
        if self.sender_config.input.is_empty() {
            return Ok(None);
        }
        let reference = Path::new(&self.sender_config.input);
        let distorted = log_dir.join(&self.receiver_config.output);
        quality::derive_and_store(reference, &distorted, log_dir).await
    }
}
