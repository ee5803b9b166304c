use anyhow::Result;
use clap::Parser;
use stagehand_workflow::COORDINATION_DIR;
use stagehand_workflow::CoordinationLayout;
use stagehand_workflow::Orchestrator;
use stagehand_workflow::OrchestratorOptions;
use stagehand_workflow::Trigger;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Watch a working directory's coordination markers and run the dev and
/// review stage programs in turn.
#[derive(Debug, Parser)]
#[command(name = "stagehand", version)]
pub struct WorkflowCli {
    /// Working directory holding `dev-stage-runner`, `review-stage-runner`
    /// and the coordination directory.
    #[arg(value_name = "WORK_DIR")]
    pub work_dir: PathBuf,

    /// Touch the three markers on a fixed schedule to walk one full cycle
    /// without external input.
    #[arg(long)]
    pub demo: bool,
}

/// Delay before each marker write in demo mode, in cycle order.
pub const DEMO_SCHEDULE: [(Duration, Trigger); 3] = [
    (Duration::from_secs(1), Trigger::TaskReady),
    (Duration::from_secs(3), Trigger::DevComplete),
    (Duration::from_secs(3), Trigger::ReviewComplete),
];

pub async fn execute(cli: WorkflowCli, cancel: CancellationToken) -> Result<()> {
    let orchestrator = Orchestrator::new(OrchestratorOptions {
        work_dir: cli.work_dir,
    })?;

    if cli.demo {
        tokio::spawn(run_demo(orchestrator.layout().clone(), cancel.clone()));
    } else {
        info!(
            "to start a task: echo start > {COORDINATION_DIR}/{}",
            Trigger::TaskReady.file_name()
        );
    }

    info!("watching for marker writes (press Ctrl+C to exit)");
    orchestrator.run(cancel).await
}

async fn run_demo(layout: CoordinationLayout, cancel: CancellationToken) {
    info!("starting demo workflow");
    for (delay, trigger) in DEMO_SCHEDULE {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        info!(marker = %trigger, "demo touching marker");
        if let Err(err) = layout.touch(trigger) {
            warn!(error = %err, "demo could not touch marker");
        }
    }
}
