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
//! Expansion of the declarative configuration into runnable experiments.
//!
//! Every experiment configuration spans a matrix: each emulation profile (one per combination of
//! the loss, delay and latency axes) is combined with each flow set (one flow variant for every
//! configured flow). Combinations matching an exclusion rule are dropped *after* the full product
//! is built, so that the identifier of every surviving experiment only depends on its position in
//! the product.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use itertools::{iproduct, Itertools};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    emulation::{EmulationProfile, TopologyHandle},
    flow::{
        command::CommandFlow,
        iperf3::{Iperf3, Iperf3Options},
        pion_abr::PionAbr,
        rtp_over_quic::{RtpOverQuic, RtpOverQuicOptions},
        FlowDescriptor, FlowSpec,
    },
    link::{validate_schedule, LinkCondition, LinkError},
    util::PathBufExt,
};

/// The content of a configuration file: a list of experiment configurations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixConfig {
    pub experiments: Vec<ExperimentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub emulation: EmulationOptions,
    #[serde(default)]
    pub flows: Vec<FlowOptions>,
}

/// Bottleneck bandwidth from `at` seconds after the experiment start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStep {
    #[serde(with = "cclab_utils::serde::duration_secs")]
    pub at: Duration,
    /// bits per second
    pub bandwidth: u64,
}

impl ScheduleStep {
    fn new(at: u64, bandwidth: u64) -> Self {
        Self {
            at: Duration::from_secs(at),
            bandwidth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationOptions {
    #[serde(default = "default_runtime", with = "cclab_utils::serde::duration_secs")]
    pub runtime: Duration,
    #[serde(default = "default_schedule")]
    pub schedule: Vec<ScheduleStep>,
    /// Loss probabilities
    #[serde(default = "default_loss")]
    pub loss: Vec<f64>,
    /// Propagation delays in milliseconds
    #[serde(default = "default_delay")]
    pub delay: Vec<u64>,
    /// Queue latency budgets in milliseconds
    #[serde(default = "default_latency")]
    pub latency: Vec<u64>,
    #[serde(default)]
    pub capture: bool,
}

fn default_runtime() -> Duration {
    Duration::from_secs(100)
}

fn default_schedule() -> Vec<ScheduleStep> {
    vec![
        ScheduleStep::new(0, 1_000_000),
        ScheduleStep::new(40, 2_500_000),
        ScheduleStep::new(60, 600_000),
        ScheduleStep::new(80, 1_000_000),
    ]
}

fn default_loss() -> Vec<f64> {
    vec![0.0]
}

fn default_delay() -> Vec<u64> {
    vec![0]
}

fn default_latency() -> Vec<u64> {
    vec![300]
}

impl Default for EmulationOptions {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            schedule: default_schedule(),
            loss: default_loss(),
            delay: default_delay(),
            latency: default_latency(),
            capture: false,
        }
    }
}

impl EmulationOptions {
    /// One profile per `(loss, delay, latency)` combination.
    pub fn expand(&self) -> Vec<EmulationProfile> {
        iproduct!(self.loss.iter(), self.delay.iter(), self.latency.iter())
            .map(|(loss, delay, latency)| EmulationProfile {
                runtime: self.runtime,
                conditions: self
                    .schedule
                    .iter()
                    .map(|step| LinkCondition {
                        offset: step.at,
                        bandwidth: step.bandwidth,
                        loss: *loss,
                        delay: Duration::from_millis(*delay),
                        latency: Duration::from_millis(*latency),
                    })
                    .collect(),
                capture: self.capture,
            })
            .collect()
    }
}

fn one() -> usize {
    1
}

/// One configured flow, possibly expanding into several variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOptions {
    /// Defaults to `l{i}`, where `i` is the index of the flow inside its experiment.
    #[serde(default)]
    pub sender_node: Option<String>,
    /// Defaults to `r{i}`, where `i` is the index of the flow inside its experiment.
    #[serde(default)]
    pub receiver_node: Option<String>,
    #[serde(
        default,
        alias = "delay",
        with = "cclab_utils::serde::duration_secs"
    )]
    pub start_offset: Duration,
    /// Number of identical flows to run.
    #[serde(default = "one")]
    pub repeat: usize,
    #[serde(flatten)]
    pub kind: FlowKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowKind {
    Iperf3(Iperf3Options),
    RtpOverQuic(RtpOverQuicOptions),
    PionAbr(PionAbr),
    Command(CommandFlow),
}

impl FlowKind {
    pub fn expand(&self) -> Vec<FlowVariant> {
        match self {
            FlowKind::Iperf3(o) => o.expand().into_iter().map(FlowVariant::Iperf3).collect(),
            FlowKind::RtpOverQuic(o) => o
                .expand()
                .into_iter()
                .map(FlowVariant::RtpOverQuic)
                .collect(),
            FlowKind::PionAbr(p) => vec![FlowVariant::PionAbr(p.clone())],
            FlowKind::Command(c) => vec![FlowVariant::Command(c.clone())],
        }
    }
}

/// A fully parameterized flow, before it is placed into an experiment.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowVariant {
    Iperf3(Iperf3),
    RtpOverQuic(RtpOverQuic),
    PionAbr(PionAbr),
    Command(CommandFlow),
}

impl FlowVariant {
    pub fn into_spec(self) -> Arc<dyn FlowSpec> {
        match self {
            FlowVariant::Iperf3(f) => Arc::new(f),
            FlowVariant::RtpOverQuic(f) => Arc::new(f),
            FlowVariant::PionAbr(f) => Arc::new(f),
            FlowVariant::Command(f) => Arc::new(f),
        }
    }
}

/// One runnable combination of the matrix.
#[derive(Debug, Clone)]
pub struct ExperimentDescriptor {
    /// `{config index}/e-{product index}`
    pub id: String,
    /// Output directory of the experiment
    pub dir: PathBuf,
    pub emulation: EmulationProfile,
    pub flows: Vec<FlowDescriptor>,
}

impl Display for ExperimentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}s, {} link conditions, {} flows [{}]",
            self.id,
            self.emulation.runtime.as_secs_f64(),
            self.emulation.conditions.len(),
            self.flows.len(),
            self.flows.iter().map(|flow| flow.spec.name()).join(", ")
        )
    }
}

/// A combination of the matrix, as seen by the exclusion rules.
pub struct Candidate<'a> {
    pub emulation: &'a EmulationProfile,
    pub flows: &'a [(&'a FlowOptions, &'a FlowVariant)],
}

impl<'a> Candidate<'a> {
    fn rtp_flows(&self) -> impl Iterator<Item = &'a RtpOverQuic> + '_ {
        self.flows.iter().filter_map(|(_, v)| match v {
            FlowVariant::RtpOverQuic(f) => Some(f),
            _ => None,
        })
    }
}

/// A named predicate that removes combinations from the matrix.
#[derive(Clone, Copy)]
pub struct Exclusion {
    pub name: &'static str,
    pub applies: fn(&Candidate<'_>) -> bool,
}

/// The exclusion rules that are active by default.
pub fn default_exclusions() -> Vec<Exclusion> {
    vec![
        Exclusion {
            name: "flow starts after the experiment ends",
            applies: |c| c.flows.iter().any(|(o, _)| o.start_offset > c.emulation.runtime),
        },
        Exclusion {
            name: "congestion control on a UDP transport",
            applies: |c| {
                c.rtp_flows()
                    .any(|f| f.transport.protocol == "udp" && f.transport.cc != "none")
            },
        },
        Exclusion {
            name: "local RFC 8888 feedback without RFC 8888",
            applies: |c| {
                c.rtp_flows()
                    .any(|f| f.rtp_cc.local_rfc8888 && f.rtp_cc.rtcp_feedback != "rfc8888")
            },
        },
    ]
}

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Experiment config {0} has an invalid link schedule: {1}")]
    Schedule(usize, LinkError),
    #[error("Flow {1} of experiment config {0} repeats zero times")]
    ZeroRepeat(usize, usize),
    #[error("Flow {1} of experiment config {0} has no variants")]
    NoVariants(usize, usize),
}

pub struct ExperimentMatrixBuilder {
    data_dir: PathBuf,
    exclusions: Vec<Exclusion>,
}

impl ExperimentMatrixBuilder {
    /// Builder placing all experiment directories below `data_dir`, with the default exclusion
    /// rules.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            exclusions: default_exclusions(),
        }
    }

    pub fn with_exclusion(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    pub fn without_exclusions(mut self) -> Self {
        self.exclusions.clear();
        self
    }

    /// Expand all experiment configurations. The result only depends on `config` and on the
    /// data directory.
    pub fn build(&self, config: &MatrixConfig) -> Result<Vec<ExperimentDescriptor>, MatrixError> {
        let mut descriptors = Vec::new();
        for (cfg_idx, cfg) in config.experiments.iter().enumerate() {
            descriptors.extend(self.build_one(cfg_idx, cfg)?);
        }
        Ok(descriptors)
    }

    fn build_one(
        &self,
        cfg_idx: usize,
        cfg: &ExperimentConfig,
    ) -> Result<Vec<ExperimentDescriptor>, MatrixError> {
        let profiles = cfg.emulation.expand();
        for profile in profiles.iter() {
            validate_schedule(&profile.conditions).map_err(|e| MatrixError::Schedule(cfg_idx, e))?;
        }

        let mut variants = Vec::with_capacity(cfg.flows.len());
        for (i, opts) in cfg.flows.iter().enumerate() {
            if opts.repeat == 0 {
                return Err(MatrixError::ZeroRepeat(cfg_idx, i));
            }
            let expanded = opts.kind.expand();
            if expanded.is_empty() {
                return Err(MatrixError::NoVariants(cfg_idx, i));
            }
            variants.push(expanded.into_iter().map(move |v| (opts, v)).collect_vec());
        }
        let flow_sets: Vec<Vec<(&FlowOptions, FlowVariant)>> = if variants.is_empty() {
            vec![Vec::new()]
        } else {
            variants.into_iter().multi_cartesian_product().collect()
        };

        let mut descriptors = Vec::new();
        for (idx, (profile, set)) in iproduct!(profiles.iter(), flow_sets.iter()).enumerate() {
            let id = format!("{cfg_idx}/e-{idx}");
            let set: Vec<(&FlowOptions, &FlowVariant)> = set.iter().map(|(o, v)| (*o, v)).collect();
            let candidate = Candidate {
                emulation: profile,
                flows: &set,
            };
            if let Some(rule) = self.exclusions.iter().find(|r| (r.applies)(&candidate)) {
                log::debug!("[matrix] skipping {id}: {}", rule.name);
                continue;
            }

            let dir = self
                .data_dir
                .as_path()
                .then(cfg_idx.to_string())
                .then(format!("e-{idx}"));
            let mut flows = Vec::new();
            for (opts, variant) in set {
                let spec = variant.clone().into_spec();
                for _ in 0..opts.repeat {
                    let i = flows.len();
                    flows.push(FlowDescriptor {
                        id: i,
                        sender_node: opts
                            .sender_node
                            .clone()
                            .unwrap_or_else(|| TopologyHandle::sender_node(i)),
                        receiver_node: opts
                            .receiver_node
                            .clone()
                            .unwrap_or_else(|| TopologyHandle::receiver_node(i)),
                        start_offset: opts.start_offset,
                        log_dir: dir.clone().then(i.to_string()),
                        spec: spec.clone(),
                    });
                }
            }
            descriptors.push(ExperimentDescriptor {
                id,
                dir,
                emulation: profile.clone(),
                flows,
            });
        }
        Ok(descriptors)
    }
}
