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
//! Complete experiments, from the topology to the experiment record.

use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tokio::time::Instant;

use super::*;
use crate::{
    events::{Endpoint, EventSource, Stream},
    matrix::ExperimentMatrixBuilder,
    orchestrator::{
        AbortReason, ExperimentOrchestrator, ExperimentRecord, ExperimentState::*,
        OrchestratorError, RunOutcome,
    },
};

fn history(dir: &Path) -> Vec<(u128, u64)> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(EmulationProfile::history_path(dir))
        .unwrap()
        .records()
        .map(|r| {
            let r = r.unwrap();
            (r[0].parse().unwrap(), r[1].parse().unwrap())
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn link_schedule_and_flow_offsets_follow_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let descriptor = experiment(
        dir.path(),
        60,
        vec![condition(0, 1_000_000), condition(40, 2_500_000)],
        vec![
            missing_flow(0, dir.path(), Duration::ZERO),
            missing_flow(1, dir.path(), Duration::from_secs(5)),
        ],
    );

    let t0 = Instant::now();
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .with_event_history()
        .run(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        report.transitions,
        [Idle, NetworkUp, FlowsStarting, Running, Draining, TornDown]
    );
    assert_eq!(substrate.teardowns(), 1);

    // initial condition, update at 40s, closing record at 60s
    let lines = history(dir.path());
    assert_eq!(
        lines.iter().map(|(_, bw)| *bw).collect::<Vec<_>>(),
        [1_000_000, 2_500_000, 2_500_000]
    );
    assert!((lines[1].0 - lines[0].0).abs_diff(40_000) < 50);
    assert!((lines[2].0 - lines[1].0).abs_diff(20_000) < 50);

    let calls = substrate.command_calls();
    assert_eq!(calls.len(), 4);
    let client = calls.iter().find(|c| c.node == "l1").unwrap();
    assert!(client.at >= t0 + Duration::from_secs(5));
    assert!(client.at < t0 + Duration::from_secs(6));
    let server = calls.iter().find(|c| c.node == "r1").unwrap();
    assert!(server.at < t0 + Duration::from_secs(1));

    // the flows failed, but the experiment ran to the end
    assert_eq!(report.flows.len(), 2);
    assert!(report.flows.iter().all(|f| f.failed()));
    let record = report.record.unwrap();
    assert!((record.duration() - 60.0).abs() < 0.1);
    assert_eq!(record.flows.len(), 2);
    assert_eq!(record.flows[1]["start_offset"], 5.0);
    assert_eq!(ExperimentRecord::read(dir.path()).unwrap(), record);

    let link = report.link.unwrap();
    assert_eq!(link.applied.len(), 2);
    assert!(report
        .events
        .iter()
        .any(|e| e.source == EventSource::Orchestrator && e.message == "state: running"));
}

#[tokio::test]
async fn crashing_flow_does_not_abort_the_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let mut crashing = shell_flow(0, &dir.path().join("0"), "sleep 30", "exit 3");
    let mut healthy = shell_flow(1, &dir.path().join("1"), "sleep 30", "echo ok; sleep 30");
    let crashing_cleanups = CountingFlow::wrap(&mut crashing);
    let healthy_cleanups = CountingFlow::wrap(&mut healthy);
    let descriptor = experiment(
        dir.path(),
        2,
        vec![condition(0, 1_000_000)],
        vec![crashing, healthy],
    );

    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .with_event_history()
        .run(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.final_state(), TornDown);
    let crashed = &report.flows[0];
    assert!(crashed.failed());
    assert!(crashed.client.exited_early);
    assert_eq!(crashed.client.exit.unwrap().code(), Some(3));
    assert!(crashed.server.killed);
    let healthy = &report.flows[1];
    assert!(!healthy.failed());
    assert!(healthy.client.killed && healthy.server.killed);

    // both flows are cleaned up, and their metrics are part of the record
    assert_eq!(crashing_cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_cleanups.load(Ordering::SeqCst), 1);
    let record = ExperimentRecord::read(dir.path()).unwrap();
    assert_eq!(record.flows.len(), 2);
    assert_eq!(record.flows[1]["quality"]["ssim"], 1.0);
    assert_eq!(record.flows[1]["quality"]["psnr"], "inf");
    let quality: QualityMetrics =
        serde_json::from_value(record.flows[1]["quality"].clone()).unwrap();
    assert_eq!(quality.psnr, Some(f64::INFINITY));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("1").join("client_stdout.log")).unwrap(),
        "ok\n"
    );
    assert!(report.events.iter().any(|e| e.source
        == EventSource::Output(1, Endpoint::Client, Stream::Stdout)
        && e.message == "ok"));
    assert!(report
        .events
        .iter()
        .any(|e| e.source == EventSource::Flow(0) && e.message.contains("exited early")));
}

#[tokio::test]
async fn interrupt_aborts_but_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let mut flow = shell_flow(0, &dir.path().join("0"), "sleep 30", "sleep 30");
    let cleanups = CountingFlow::wrap(&mut flow);
    let descriptor = experiment(
        dir.path(),
        30,
        vec![condition(0, 1_000_000), condition(10, 2_000_000)],
        vec![flow],
    );

    let start = std::time::Instant::now();
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(tokio::time::sleep(Duration::from_millis(500)))
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));

    assert_eq!(report.outcome, RunOutcome::Aborted(AbortReason::Interrupted));
    assert_eq!(
        report.transitions,
        [Idle, NetworkUp, FlowsStarting, Running, Aborted, Draining, TornDown]
    );
    assert!(report.flows[0].server.killed && report.flows[0].client.killed);
    assert!(report.record.is_none());
    assert!(!dir.path().join(ExperimentRecord::FILE).exists());
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    assert_eq!(substrate.teardowns(), 1);
    // the pending update is never applied, but the history is closed
    let link = report.link.unwrap();
    assert_eq!(link.remaining.len(), 1);
    assert_eq!(history(dir.path()).len(), 2);
}

/// Keeps the output pipes open for one more second after the process group of the flow is killed.
const LINGER: &str =
    "setsid sh -c 'while kill -0 \"$0\" 2>/dev/null; do sleep 0.1; done; sleep 1' $$ & sleep 30";

#[tokio::test]
async fn all_flows_are_stopped_together() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let flows = (0..3)
        .map(|i| shell_flow(i, &dir.path().join(i.to_string()), "sleep 30", LINGER))
        .collect();
    let descriptor = experiment(dir.path(), 1, vec![condition(0, 1_000_000)], flows);

    let start = std::time::Instant::now();
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.flows.len(), 3);
    assert!(report.flows.iter().all(|f| f.client.killed && !f.failed()));
    // every client lingers for a second, but they linger at the same time
    assert!(elapsed > Duration::from_millis(1900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_setup_launches_no_flow() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let descriptor = experiment(
        dir.path(),
        60,
        vec![condition(0, 1_000_000), condition(10, 2_000_000)],
        vec![
            missing_flow(0, dir.path(), Duration::ZERO),
            missing_flow(1, dir.path(), Duration::ZERO),
        ],
    );
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::ready(()))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted(AbortReason::Interrupted));
    assert_eq!(
        report.transitions,
        [Idle, NetworkUp, Aborted, Draining, TornDown]
    );
    assert!(report.flows.is_empty());
    assert!(report.link.is_none());
    assert!(substrate.command_calls().is_empty());
    assert_eq!(substrate.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn topology_failure_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default().fail_create());
    let descriptor = experiment(
        dir.path(),
        60,
        vec![condition(0, 1_000_000)],
        vec![missing_flow(0, dir.path(), Duration::ZERO)],
    );
    let result = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await;
    assert!(matches!(result, Err(OrchestratorError::Topology(_))));
    assert!(substrate.command_calls().is_empty());
    assert!(substrate.shaping_calls().is_empty());
    assert_eq!(substrate.teardowns(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_schedule_aborts_after_the_network_is_up() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let descriptor = experiment(
        dir.path(),
        60,
        vec![],
        vec![missing_flow(0, dir.path(), Duration::ZERO)],
    );
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted(AbortReason::Setup(_))
    ));
    assert_eq!(
        report.transitions,
        [Idle, NetworkUp, Aborted, Draining, TornDown]
    );
    assert!(report.flows.is_empty());
    assert!(substrate.command_calls().is_empty());
    assert_eq!(substrate.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_receiver_only_fails_its_flow() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let mut lost = missing_flow(0, dir.path(), Duration::ZERO);
    lost.receiver_node = "r9".to_string();
    let descriptor = experiment(
        dir.path(),
        10,
        vec![condition(0, 1_000_000)],
        vec![lost, missing_flow(1, dir.path(), Duration::ZERO)],
    );
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(matches!(
        report.flows[0].server.error,
        Some(FlowError::Address(_, _))
    ));
    assert!(!report.flows[0].client.launched());
    // only flow 1 reached the substrate
    let nodes: Vec<String> = substrate
        .command_calls()
        .into_iter()
        .map(|c| c.node)
        .collect();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.ends_with('1')));
}

#[tokio::test(start_paused = true)]
async fn experiment_without_flows() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let descriptor = experiment(dir.path(), 10, vec![condition(0, 1_000_000)], vec![]);
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let record = report.record.unwrap();
    assert!(record.flows.is_empty());
    assert!((record.duration() - 10.0).abs() < 0.1);
    assert_eq!(history(dir.path()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_runtime_ends_right_away() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(RecordingSubstrate::default());
    let descriptor = experiment(
        dir.path(),
        0,
        vec![condition(0, 1_000_000), condition(5, 2_000_000)],
        vec![missing_flow(0, dir.path(), Duration::from_secs(5))],
    );
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.record.unwrap().duration() < 0.1);
    // the late client never launched
    assert!(!report.flows[0].client.launched());
    assert!(report.flows[0].client.error.is_none());
    assert_eq!(report.link.unwrap().remaining.len(), 1);
}

#[tokio::test]
async fn configured_matrix_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config: crate::matrix::MatrixConfig = serde_yaml::from_str(
        r#"
- emulation:
    runtime: 1
    schedule:
      - at: 0
        bandwidth: 1000000
  flows:
    - kind: command
      repeat: 2
      server: [sh, -c, "sleep 30"]
      client: [sh, -c, "echo port {port}"]
"#,
    )
    .unwrap();
    let descriptors = ExperimentMatrixBuilder::new(dir.path()).build(&config).unwrap();
    assert_eq!(descriptors.len(), 1);
    let descriptor = descriptors.into_iter().next().unwrap();
    let exp_dir = descriptor.dir.clone();
    assert_eq!(exp_dir, dir.path().join("0").join("e-0"));

    let substrate = Arc::new(RecordingSubstrate::default());
    let report = ExperimentOrchestrator::new(descriptor, substrate.clone())
        .run(std::future::pending())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.flows.iter().all(|f| !f.failed()));

    // every flow gets its own port, filled into the templates
    let mut commands: Vec<(String, String)> = substrate
        .command_calls()
        .into_iter()
        .map(|c| (c.node, c.command))
        .collect();
    commands.sort();
    assert_eq!(
        commands,
        [
            ("l0", "sh -c echo port 4242"),
            ("l1", "sh -c echo port 4243"),
            ("r0", "sh -c sleep 30"),
            ("r1", "sh -c sleep 30"),
        ]
        .map(|(n, c)| (n.to_string(), c.to_string()))
    );

    assert!(exp_dir.join("config.json").exists());
    assert_eq!(history(&exp_dir).len(), 2);
    assert_eq!(
        std::fs::read_to_string(exp_dir.join("1").join("client_stdout.log")).unwrap(),
        "port 4243\n"
    );
    let record = ExperimentRecord::read(&exp_dir).unwrap();
    assert_eq!(record.flows[0]["kind"], "command");
    assert_eq!(record.emulation["runtime"], 1.0);
}
