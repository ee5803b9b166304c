use crate::layout::CoordinationLayout;
use crate::machine::StateMachine;
use crate::state::StateHandle;
use crate::state::Trigger;
use crate::supervisor::ProcessSupervisor;
use crate::supervisor::StageExit;
use crate::watch::WatchEvent;
use crate::watch::WatchSource;
use anyhow::Result;
use anyhow::anyhow;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub work_dir: PathBuf,
}

/// Watches the coordination directory and drives the dev/review cycle.
///
/// Construction does all setup (directory, markers, subscription); `run`
/// is the dispatch loop and returns once the cancellation token fires.
pub struct Orchestrator {
    layout: CoordinationLayout,
    watch: WatchSource,
    machine: StateMachine,
    exits: mpsc::UnboundedReceiver<StageExit>,
}

impl Orchestrator {
    pub fn new(opts: OrchestratorOptions) -> Result<Self> {
        let layout = CoordinationLayout::new(opts.work_dir);
        layout.ensure_directory()?;
        layout.ensure_markers();
        let watch = WatchSource::subscribe(layout.coordination_dir())?;

        let (supervisor, exits) = ProcessSupervisor::new(layout.work_dir().to_path_buf());
        let machine = StateMachine::new(layout.clone(), supervisor);
        Ok(Self {
            layout,
            watch,
            machine,
            exits,
        })
    }

    pub fn layout(&self) -> &CoordinationLayout {
        &self.layout
    }

    pub fn state_handle(&self) -> StateHandle {
        self.machine.handle()
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(dir = %self.layout.coordination_dir().display(), "orchestrator watching");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = self.watch.next() => match event {
                    Some(event) => self.dispatch(event),
                    None => break Err(anyhow!(
                        "file watch on {} ended unexpectedly",
                        self.layout.coordination_dir().display()
                    )),
                },
                Some(exit) = self.exits.recv() => self.machine.on_stage_exit(exit),
            }
        };

        info!("stopping orchestrator");
        self.machine.supervisor().stop();
        self.watch.close();
        result
    }

    fn dispatch(&mut self, event: WatchEvent) {
        let name = event.file_name.to_string_lossy();
        debug!(file = %name, state = %self.machine.state(), "file written");
        match Trigger::from_file_name(&name) {
            Some(trigger) => self.machine.on_trigger(trigger),
            None => debug!(file = %name, kind = ?event.kind, "not a marker, ignoring"),
        }
    }
}
