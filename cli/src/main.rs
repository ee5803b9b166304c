use anyhow::Result;
use clap::Parser;
use stagehand_cli::init_tracing;
use stagehand_cli::workflow_cmd;
use stagehand_cli::workflow_cmd::WorkflowCli;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WorkflowCli::parse();
    init_tracing();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(err) => warn!(error = %err, "failed to listen for Ctrl+C"),
        }
        on_signal.cancel();
    });

    workflow_cmd::execute(cli, cancel).await
}
