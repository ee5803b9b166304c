use crate::layout::CoordinationLayout;
use crate::state::Action;
use crate::state::Stage;
use crate::state::StateHandle;
use crate::state::Trigger;
use crate::state::WorkflowState;
use crate::state::transition;
use crate::supervisor::ProcessSupervisor;
use crate::supervisor::StageError;
use crate::supervisor::StageExit;
use std::ffi::OsString;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Applies marker events and stage exits to the workflow state. Every state
/// write goes through here; it is driven by a single dispatch loop.
pub(crate) struct StateMachine {
    layout: CoordinationLayout,
    supervisor: ProcessSupervisor,
    state: watch::Sender<WorkflowState>,
    // Stage whose launch waits for the previous process to be reaped.
    pending: Option<Stage>,
}

impl StateMachine {
    pub(crate) fn new(layout: CoordinationLayout, supervisor: ProcessSupervisor) -> Self {
        let (state, _) = watch::channel(WorkflowState::Idle);
        Self {
            layout,
            supervisor,
            state,
            pending: None,
        }
    }

    pub(crate) fn handle(&self) -> StateHandle {
        StateHandle::new(self.state.subscribe())
    }

    pub(crate) fn state(&self) -> WorkflowState {
        *self.state.borrow()
    }

    pub(crate) fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn set_state(&self, next: WorkflowState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "state changed");
        }
    }

    pub(crate) fn on_trigger(&mut self, trigger: Trigger) {
        let current = self.state();
        let Some(step) = transition(current, trigger) else {
            debug!(marker = %trigger, state = %current, "marker ignored in current state");
            return;
        };

        self.set_state(step.next);
        // A parked launch only survives while its stage's state does.
        if let Some(stage) = self
            .pending
            .take_if(|stage| stage.running_state() != step.next)
        {
            info!(%stage, "dropping deferred stage launch");
        }

        match step.action {
            Action::StartStage(stage) => self.launch(stage),
            Action::CompleteCycle => info!("cycle complete, returning to idle"),
        }
    }

    pub(crate) fn on_stage_exit(&mut self, exit: StageExit) {
        if !self.supervisor.reap(&exit) {
            debug!(stage = %exit.stage, id = exit.id, "exit of an already released process");
        }

        if !exit.outcome.is_success() {
            let current = self.state();
            if current.stage().is_some() {
                error!(
                    stage = %exit.stage,
                    script = %exit.script.display(),
                    outcome = ?exit.outcome,
                    "stage failed, workflow halted"
                );
                self.pending = None;
                self.set_state(WorkflowState::Error);
            } else {
                warn!(
                    stage = %exit.stage,
                    state = %current,
                    outcome = ?exit.outcome,
                    "stage failed outside a running state"
                );
            }
            return;
        }

        if let Some(stage) = self.pending.take() {
            info!(%stage, "previous process released, starting deferred stage");
            self.launch(stage);
        }
    }

    fn launch(&mut self, stage: Stage) {
        let script = self.layout.stage_script(stage);
        info!(%stage, script = %script.display(), "starting stage");
        let args = [OsString::from(self.layout.work_dir())];
        match self.supervisor.start_stage(stage, &script, &args) {
            Ok(_) => {}
            Err(StageError::SlotBusy { running }) => {
                info!(%stage, %running, "previous stage process still live, deferring launch");
                self.pending = Some(stage);
            }
            Err(err) => {
                error!(%stage, error = %err, "failed to launch stage");
                self.pending = None;
                self.set_state(WorkflowState::Error);
            }
        }
    }
}
