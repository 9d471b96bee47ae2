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
//! Time-varying link conditions and the runner that applies them to the emulated bottleneck.

use std::{
    collections::{BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::sleep_until};

use cclab_utils::other::unix_millis;

use crate::{
    clock::ExperimentClock,
    emulation::{ShapingMode, Substrate, SubstrateError, TopologyHandle},
    events::{EventSink, EventSource},
    util::wait_until_set,
};

/// Bandwidth, loss, delay and queue latency budget of the bottleneck, valid from `offset` after
/// the experiment start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkCondition {
    #[serde(rename = "start_time", with = "cclab_utils::serde::duration_secs")]
    pub offset: Duration,
    /// bits per second
    pub bandwidth: u64,
    /// loss probability in `0..=1`
    pub loss: f64,
    /// propagation delay
    #[serde(with = "cclab_utils::serde::duration_secs")]
    pub delay: Duration,
    /// queue latency budget of the token bucket
    #[serde(with = "cclab_utils::serde::duration_secs")]
    pub latency: Duration,
}

impl LinkCondition {
    /// Fields of the link-history line: `wall-clock-ms, bandwidth, loss, delay-ms, latency-ms`.
    pub fn history_record(&self, wall: SystemTime) -> [String; 5] {
        [
            unix_millis(wall).to_string(),
            self.bandwidth.to_string(),
            self.loss.to_string(),
            self.delay.as_millis().to_string(),
            self.latency.as_millis().to_string(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("The link schedule is empty")]
    EmptySchedule,
    #[error("The first link condition starts at {0:?} instead of at the experiment start")]
    LateStart(Duration),
    #[error("Link condition {0} starts before its predecessor")]
    Unordered(usize),
    #[error("Link condition {0} has a loss probability outside of [0, 1]: {1}")]
    InvalidLoss(usize, f64),
    #[error("Cannot write the link history: {0}")]
    History(#[from] csv::Error),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Link shaping failed: {0}")]
    Shaping(#[from] SubstrateError),
}

/// Check that a sequence of conditions is non-empty, starts at offset zero, is ordered by offset,
/// and has valid loss probabilities.
pub fn validate_schedule(conditions: &[LinkCondition]) -> Result<(), LinkError> {
    match conditions.first() {
        None => return Err(LinkError::EmptySchedule),
        // the initial condition is installed before any flow starts
        Some(first) if !first.offset.is_zero() => return Err(LinkError::LateStart(first.offset)),
        Some(_) => {}
    }
    for (i, c) in conditions.iter().enumerate() {
        if !(0.0..=1.0).contains(&c.loss) {
            return Err(LinkError::InvalidLoss(i, c.loss));
        }
        if i > 0 && c.offset < conditions[i - 1].offset {
            return Err(LinkError::Unordered(i));
        }
    }
    Ok(())
}

/// Append-only CSV log (without header) of every applied link condition.
pub struct LinkHistory {
    path: PathBuf,
    csv: csv::Writer<fs::File>,
}

impl LinkHistory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let csv = csv::WriterBuilder::new().has_headers(false).from_writer(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?,
        );
        Ok(Self { path, csv })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, wall: SystemTime, condition: &LinkCondition) -> Result<(), LinkError> {
        self.csv.write_record(condition.history_record(wall))?;
        self.csv.flush()?;
        Ok(())
    }
}

/// Cursor over the link schedule. Only the runner task mutates it.
#[derive(Debug, Clone, Default)]
pub struct LinkScheduleState {
    /// Indices of conditions that were applied (successfully or not).
    pub applied: BTreeSet<usize>,
    /// Pending conditions, in the order they will be applied.
    pub remaining: VecDeque<(usize, LinkCondition)>,
    /// The condition that was applied most recently.
    pub last_applied: Option<LinkCondition>,
}

/// Applies the link schedule to the topology. This is the only writer of shaping rules.
pub struct LinkScheduleRunner {
    substrate: Arc<dyn Substrate>,
    topology: Arc<TopologyHandle>,
    history: LinkHistory,
    state: LinkScheduleState,
    sink: EventSink,
}

impl LinkScheduleRunner {
    pub fn new(
        conditions: &[LinkCondition],
        history_path: impl AsRef<Path>,
        substrate: Arc<dyn Substrate>,
        topology: Arc<TopologyHandle>,
        sink: EventSink,
    ) -> Result<Self, LinkError> {
        validate_schedule(conditions)?;
        Ok(Self {
            substrate,
            topology,
            history: LinkHistory::open(history_path)?,
            state: LinkScheduleState {
                remaining: conditions.iter().copied().enumerate().collect(),
                ..Default::default()
            },
            sink,
        })
    }

    pub fn state(&self) -> &LinkScheduleState {
        &self.state
    }

    /// Apply the first condition right away, installing the shaping rules. Must be called before
    /// any flow starts so that the link is never in an undefined state.
    pub async fn apply_initial(&mut self) {
        if let Some((idx, condition)) = self.state.remaining.pop_front() {
            self.apply_one(idx, condition, ShapingMode::Initial, SystemTime::now())
                .await;
        }
    }

    /// Push one condition to the substrate and record it in the link history. The history line is
    /// written even if shaping fails.
    pub async fn apply_one(
        &mut self,
        idx: usize,
        condition: LinkCondition,
        mode: ShapingMode,
        wall: SystemTime,
    ) {
        log::debug!(
            "[link] applying condition {idx} ({mode}): {} bit/s, loss {}, delay {:?}, latency {:?}",
            condition.bandwidth,
            condition.loss,
            condition.delay,
            condition.latency
        );
        let mut failed = false;
        for iface in self.topology.bottleneck.iter() {
            if let Err(e) = self
                .substrate
                .apply_link_shaping(&self.topology, iface, &condition, mode)
                .await
            {
                failed = true;
                log::error!("[link] update {idx} failed on {iface}: {e}");
                self.sink
                    .emit(EventSource::Link, format!("link update {idx} failed on {iface}: {e}"))
                    .await;
            }
        }
        if !failed {
            self.sink
                .emit(
                    EventSource::Link,
                    format!("link update {idx}: {} bit/s", condition.bandwidth),
                )
                .await;
        }
        if let Err(e) = self.history.append(wall, &condition) {
            log::error!(
                "[link] cannot write {}: {e}",
                self.history.path().to_string_lossy()
            );
        }
        self.state.applied.insert(idx);
        self.state.last_applied = Some(condition);
    }

    /// Spawn the scheduling task. Each remaining condition is applied at `clock.at(offset)`.
    pub fn start(self, clock: ExperimentClock) -> LinkScheduleHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(clock, stop_rx));
        LinkScheduleHandle { stop, clock, task }
    }

    async fn run(mut self, clock: ExperimentClock, mut stop: watch::Receiver<bool>) -> Self {
        while let Some((idx, condition)) = self.state.remaining.pop_front() {
            tokio::select! {
                _ = sleep_until(clock.at(condition.offset)) => {
                    self.apply_one(idx, condition, ShapingMode::Update, clock.wall_now()).await;
                }
                _ = wait_until_set(&mut stop) => {
                    self.state.remaining.push_front((idx, condition));
                    break;
                }
            }
        }
        self
    }

    /// Write the closing history record, repeating the last applied condition, so that consumers
    /// know how long it held.
    pub fn close(mut self, wall: SystemTime) -> LinkScheduleState {
        if let Some(last) = self.state.last_applied {
            if let Err(e) = self.history.append(wall, &last) {
                log::error!(
                    "[link] cannot write {}: {e}",
                    self.history.path().to_string_lossy()
                );
            }
        }
        if !self.state.remaining.is_empty() {
            log::debug!(
                "[link] closing with {} conditions not applied",
                self.state.remaining.len()
            );
        }
        self.state
    }
}

/// Handle to a running [`LinkScheduleRunner`].
pub struct LinkScheduleHandle {
    stop: watch::Sender<bool>,
    clock: ExperimentClock,
    task: JoinHandle<LinkScheduleRunner>,
}

impl LinkScheduleHandle {
    /// Stop scheduling further conditions, wait for the task, and write the closing record.
    /// Returns `None` if the scheduling task panicked.
    pub async fn close(self) -> Option<LinkScheduleState> {
        self.stop.send_replace(true);
        match self.task.await {
            Ok(runner) => Some(runner.close(self.clock.wall_now())),
            Err(e) => {
                log::error!("[link] schedule task failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test::{condition, RecordingSubstrate};

    fn read_history(path: &Path) -> Vec<Vec<u128>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap()
            .records()
            .map(|r| {
                let r = r.unwrap();
                vec![r[0].parse().unwrap(), r[1].parse().unwrap()]
            })
            .collect()
    }

    #[test]
    fn schedule_validation() {
        assert!(matches!(validate_schedule(&[]), Err(LinkError::EmptySchedule)));
        assert!(matches!(
            validate_schedule(&[condition(0, 1_000_000), condition(10, 2_000_000), condition(5, 1)]),
            Err(LinkError::Unordered(2))
        ));
        let mut lossy = condition(0, 1_000_000);
        lossy.loss = 1.5;
        assert!(matches!(
            validate_schedule(&[lossy]),
            Err(LinkError::InvalidLoss(0, _))
        ));
        // equal offsets are allowed
        assert!(validate_schedule(&[condition(0, 1), condition(0, 2)]).is_ok());
    }

    #[tokio::test]
    async fn schedule_must_start_with_the_experiment() {
        let late = [condition(10, 1_000_000), condition(20, 2_000_000)];
        assert!(matches!(
            validate_schedule(&late),
            Err(LinkError::LateStart(offset)) if offset == Duration::from_secs(10)
        ));

        // nothing is shaped, and no history is written
        let dir = tempfile::tempdir().unwrap();
        let substrate = Arc::new(RecordingSubstrate::default());
        let topo = Arc::new(substrate.create(1).await);
        let (sink, _rx) = EventSink::channel(64);
        let history_path = dir.path().join("link.log");
        assert!(matches!(
            LinkScheduleRunner::new(&late, &history_path, substrate.clone(), topo, sink),
            Err(LinkError::LateStart(_))
        ));
        assert!(substrate.shaping_calls().is_empty());
        assert!(!history_path.exists());
    }

    #[test]
    fn history_record_format() {
        let mut c = condition(40, 2_500_000);
        c.loss = 0.01;
        c.delay = Duration::from_millis(50);
        let wall = std::time::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(
            c.history_record(wall),
            ["1700000000123", "2500000", "0.01", "50", "300"].map(String::from)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_match_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Arc::new(RecordingSubstrate::default());
        let topo = Arc::new(substrate.create(1).await);
        let (sink, _rx) = EventSink::channel(64);
        let schedule = [
            condition(0, 1_000_000),
            condition(40, 2_500_000),
            condition(60, 600_000),
        ];
        let history_path = dir.path().join("link.log");
        let mut runner = LinkScheduleRunner::new(
            &schedule,
            &history_path,
            substrate.clone(),
            topo.clone(),
            sink,
        )
        .unwrap();
        runner.apply_initial().await;
        let clock = ExperimentClock::start_now();
        let handle = runner.start(clock);

        tokio::time::sleep(Duration::from_secs(70)).await;
        let state = handle.close().await.unwrap();
        assert_eq!(state.applied, BTreeSet::from([0, 1, 2]));
        assert!(state.remaining.is_empty());
        assert_eq!(state.last_applied, Some(schedule[2]));

        let history = read_history(&history_path);
        assert_eq!(history.len(), 4);
        let gaps: Vec<u128> = history.windows(2).map(|w| w[1][0] - w[0][0]).collect();
        for (gap, expected) in gaps.iter().zip([40_000, 20_000, 10_000]) {
            assert!(gap.abs_diff(expected) < 50, "gap {gap} ms, expected {expected} ms");
        }
        assert_eq!(history[3][1], 600_000);

        let modes: Vec<ShapingMode> = substrate.shaping_calls().iter().map(|c| c.mode).collect();
        // both ends of the bottleneck are shaped for every condition
        assert_eq!(
            modes,
            [
                ShapingMode::Initial,
                ShapingMode::Initial,
                ShapingMode::Update,
                ShapingMode::Update,
                ShapingMode::Update,
                ShapingMode::Update
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shaping_failures_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Arc::new(RecordingSubstrate::default().fail_shaping_for(2_500_000));
        let topo = Arc::new(substrate.create(1).await);
        let (sink, _rx) = EventSink::channel(64);
        let schedule = [
            condition(0, 1_000_000),
            condition(10, 2_500_000),
            condition(20, 600_000),
        ];
        let history_path = dir.path().join("link.log");
        let mut runner =
            LinkScheduleRunner::new(&schedule, &history_path, substrate.clone(), topo, sink)
                .unwrap();
        runner.apply_initial().await;
        let handle = runner.start(ExperimentClock::start_now());
        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = handle.close().await.unwrap();

        // the failed update is still recorded, and the next one is attempted
        assert_eq!(state.applied.len(), 3);
        let bandwidths: Vec<u128> = read_history(&history_path).iter().map(|r| r[1]).collect();
        assert_eq!(bandwidths, [1_000_000, 2_500_000, 600_000, 600_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_schedule_ends() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Arc::new(RecordingSubstrate::default());
        let topo = Arc::new(substrate.create(1).await);
        let (sink, _rx) = EventSink::channel(64);
        let schedule = [condition(0, 1_000_000), condition(40, 2_500_000)];
        let history_path = dir.path().join("link.log");
        let mut runner =
            LinkScheduleRunner::new(&schedule, &history_path, substrate, topo, sink).unwrap();
        runner.apply_initial().await;
        let handle = runner.start(ExperimentClock::start_now());
        tokio::time::sleep(Duration::from_secs(10)).await;
        let state = handle.close().await.unwrap();

        assert_eq!(state.applied, BTreeSet::from([0]));
        assert_eq!(state.remaining.len(), 1);
        let history = read_history(&history_path);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1][1], 1_000_000);
        assert!((history[1][0] - history[0][0]).abs_diff(10_000) < 50);
    }
}
