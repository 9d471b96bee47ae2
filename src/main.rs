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
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::watch;

use cclab::{
    emulation::{LocalSubstrate, NetnsSubstrate, Substrate},
    matrix::ExperimentMatrixBuilder,
    orchestrator::{ExperimentOrchestrator, RunOutcome},
    util::{self, wait_until_set},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SubstrateKind {
    /// Linux network namespaces, shaped with tc (requires root)
    Netns,
    /// Run everything on the local host without shaping
    Local,
}

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Experiment configurations (YAML, or JSON if the file ends in `.json`).
    #[arg(short, long, default_value = "./config.yaml")]
    config_file: String,
    /// Root directory of all experiment outputs.
    #[arg(short, long, default_value = "data/")]
    data_dir: String,
    /// Network emulation to run the experiments on.
    #[arg(long, value_enum, default_value_t = SubstrateKind::Netns)]
    substrate: SubstrateKind,
    /// Print the expanded experiments and exit.
    #[arg(long)]
    list: bool,
    /// Only run experiments whose id contains this string.
    #[arg(long, default_value = "")]
    filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = MultiProgress::new();
    util::init_logging(multi.clone())?;

    let args = Args::parse();

    let config = util::load_config(&args.config_file)?;
    let experiments: Vec<_> = ExperimentMatrixBuilder::new(&args.data_dir)
        .build(&config)?
        .into_iter()
        .filter(|e| e.id.contains(&args.filter))
        .collect();

    if args.list {
        for e in experiments.iter() {
            println!("{e}");
        }
        return Ok(());
    }
    log::info!(
        "[main] running {} experiments from {}",
        experiments.len(),
        args.config_file
    );

    let substrate: Arc<dyn Substrate> = match args.substrate {
        SubstrateKind::Netns => Arc::new(NetnsSubstrate::default()),
        SubstrateKind::Local => Arc::new(LocalSubstrate::default()),
    };

    let (interrupt, interrupted) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[main] interrupted, stopping the current experiment");
            interrupt.send_replace(true);
        }
    });

    let pb = multi.add(
        ProgressBar::new(experiments.len() as u64).with_style(
            ProgressStyle::with_template(
                "[{bar:60}] {pos:>4}/{len:4} {msg}, elapsed: {elapsed}, eta: {eta}",
            )?
            .progress_chars("##-"),
        ),
    );

    let mut failed_topologies = 0;
    for experiment in experiments {
        if *interrupted.borrow() {
            break;
        }
        pb.set_message(experiment.id.clone());
        let id = experiment.id.clone();
        let mut flag = interrupted.clone();
        let orchestrator = ExperimentOrchestrator::new(experiment, substrate.clone());
        match orchestrator.run(async move { wait_until_set(&mut flag).await }).await {
            Ok(report) => {
                let failed = report.flows.iter().filter(|f| f.failed()).count();
                match report.outcome {
                    RunOutcome::Completed if failed == 0 => log::info!("[main] {id} completed"),
                    RunOutcome::Completed => {
                        log::warn!("[main] {id} completed with {failed} failed flows")
                    }
                    RunOutcome::Aborted(reason) => log::warn!("[main] {id} aborted: {reason}"),
                }
            }
            Err(e) => {
                log::error!("[main] {id}: {e}");
                failed_topologies += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if failed_topologies > 0 {
        return Err(format!("{failed_topologies} experiments could not create their topology").into());
    }
    Ok(())
}
