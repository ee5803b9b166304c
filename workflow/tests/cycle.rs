#![cfg(unix)]

use pretty_assertions::assert_eq;
use serial_test::serial;
use stagehand_workflow::CoordinationLayout;
use stagehand_workflow::Orchestrator;
use stagehand_workflow::OrchestratorOptions;
use stagehand_workflow::Stage;
use stagehand_workflow::StateHandle;
use stagehand_workflow::Trigger;
use stagehand_workflow::WorkflowState;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    layout: CoordinationLayout,
    state: StateHandle,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    fn start(work_dir: &Path) -> Self {
        let orchestrator = Orchestrator::new(OrchestratorOptions {
            work_dir: work_dir.to_path_buf(),
        })
        .expect("orchestrator");
        let layout = orchestrator.layout().clone();
        let state = orchestrator.state_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(cancel.clone()));
        Self {
            layout,
            state,
            cancel,
            task,
        }
    }

    async fn reach(&self, want: WorkflowState) {
        let seen = self.state.wait_for(WAIT, |state| state == want).await;
        assert_eq!(seen, Some(want), "current state {}", self.state.get());
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("run loop exits after cancel")
            .expect("run task joins")
            .expect("run loop succeeds");
    }
}

fn write_script(dir: &Path, stage: Stage, body: &str) {
    let path = dir.join(stage.script_name());
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

async fn wait_for_file(path: &Path) {
    let appeared = tokio::time::timeout(WAIT, async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(appeared.is_ok(), "{} never appeared", path.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn markers_drive_a_full_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), Stage::Dev, "echo \"$1\" > dev-arg");
    write_script(dir.path(), Stage::Review, "touch review-ran");

    let running = Running::start(dir.path());
    assert_eq!(running.state.get(), WorkflowState::Idle);
    for trigger in Trigger::ALL {
        assert!(running.layout.marker_path(trigger).exists());
    }

    running.layout.touch(Trigger::TaskReady).expect("touch");
    running.reach(WorkflowState::DevRunning).await;
    wait_for_file(&dir.path().join("dev-arg")).await;

    running.layout.touch(Trigger::DevComplete).expect("touch");
    running.reach(WorkflowState::ReviewRunning).await;
    wait_for_file(&dir.path().join("review-ran")).await;

    running.layout.touch(Trigger::ReviewComplete).expect("touch");
    running.reach(WorkflowState::Idle).await;

    let arg = fs::read_to_string(dir.path().join("dev-arg")).expect("dev-arg");
    assert_eq!(Path::new(arg.trim()), dir.path());
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn failing_dev_stage_halts_the_workflow() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), Stage::Dev, "exit 1");
    write_script(dir.path(), Stage::Review, "touch review-ran");

    let running = Running::start(dir.path());
    running.layout.touch(Trigger::TaskReady).expect("touch");
    running.reach(WorkflowState::Error).await;

    for trigger in Trigger::ALL {
        running.layout.touch(trigger).expect("touch");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.state.get(), WorkflowState::Error);
    assert!(!dir.path().join("review-ran").exists());
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn missing_stage_script_halts_the_workflow() {
    let dir = tempfile::tempdir().expect("tempdir");

    let running = Running::start(dir.path());
    running.layout.touch(Trigger::TaskReady).expect("touch");
    running.reach(WorkflowState::Error).await;
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn wrong_source_state_and_strangers_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");

    let running = Running::start(dir.path());
    running.layout.touch(Trigger::ReviewComplete).expect("touch");
    running.layout.touch(Trigger::DevComplete).expect("touch");
    fs::write(
        running.layout.coordination_dir().join("notes.txt"),
        "hello\n",
    )
    .expect("write stranger");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.state.get(), WorkflowState::Idle);
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn restart_does_not_refire_existing_markers() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), Stage::Dev, "touch dev-ran");
    let layout = CoordinationLayout::new(dir.path().to_path_buf());
    layout.ensure_directory().expect("coordination dir");
    layout.ensure_markers();
    layout.touch(Trigger::TaskReady).expect("touch");
    let before = fs::read_to_string(layout.marker_path(Trigger::TaskReady)).expect("read");

    let running = Running::start(dir.path());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.state.get(), WorkflowState::Idle);
    assert!(!dir.path().join("dev-ran").exists());
    assert_eq!(
        fs::read_to_string(layout.marker_path(Trigger::TaskReady)).expect("read"),
        before
    );
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn cancel_stops_a_live_stage_without_waiting() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(dir.path(), Stage::Dev, "touch dev-started\nsleep 30");

    let running = Running::start(dir.path());
    running.layout.touch(Trigger::TaskReady).expect("touch");
    running.reach(WorkflowState::DevRunning).await;
    wait_for_file(&dir.path().join("dev-started")).await;

    let started = std::time::Instant::now();
    running.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
