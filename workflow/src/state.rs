use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Position of the single workflow instance in the dev/review cycle.
///
/// `Error` has no outgoing transition; it sticks until the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkflowState {
    #[default]
    Idle,
    DevRunning,
    ReviewRunning,
    Error,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 4] = [
        WorkflowState::Idle,
        WorkflowState::DevRunning,
        WorkflowState::ReviewRunning,
        WorkflowState::Error,
    ];

    /// The stage whose process backs this state, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            WorkflowState::DevRunning => Some(Stage::Dev),
            WorkflowState::ReviewRunning => Some(Stage::Review),
            WorkflowState::Idle | WorkflowState::Error => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::DevRunning => "dev-running",
            WorkflowState::ReviewRunning => "review-running",
            WorkflowState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One of the externally executed phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Dev,
    Review,
}

impl Stage {
    /// File name of the stage program inside the working directory.
    pub fn script_name(self) -> &'static str {
        match self {
            Stage::Dev => "dev-stage-runner",
            Stage::Review => "review-stage-runner",
        }
    }

    pub fn running_state(self) -> WorkflowState {
        match self {
            Stage::Dev => WorkflowState::DevRunning,
            Stage::Review => WorkflowState::ReviewRunning,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Dev => f.write_str("dev"),
            Stage::Review => f.write_str("review"),
        }
    }
}

/// A marker file whose write event signals one workflow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    TaskReady,
    DevComplete,
    ReviewComplete,
}

impl Trigger {
    pub const ALL: [Trigger; 3] = [
        Trigger::TaskReady,
        Trigger::DevComplete,
        Trigger::ReviewComplete,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Trigger::TaskReady => "task-ready.trigger",
            Trigger::DevComplete => "dev-complete.trigger",
            Trigger::ReviewComplete => "review-complete.trigger",
        }
    }

    /// Maps a marker basename back to its trigger. Anything else in the
    /// coordination directory is not a marker.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|trigger| trigger.file_name() == name)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// What the state machine does when a marker fires in the right state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartStage(Stage),
    CompleteCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub next: WorkflowState,
}

/// The marker transition table. `None` means the event is ignored and the
/// state stays where it is.
pub fn transition(state: WorkflowState, trigger: Trigger) -> Option<Transition> {
    match (state, trigger) {
        (WorkflowState::Idle, Trigger::TaskReady) => Some(Transition {
            action: Action::StartStage(Stage::Dev),
            next: WorkflowState::DevRunning,
        }),
        (WorkflowState::DevRunning, Trigger::DevComplete) => Some(Transition {
            action: Action::StartStage(Stage::Review),
            next: WorkflowState::ReviewRunning,
        }),
        (WorkflowState::ReviewRunning, Trigger::ReviewComplete) => Some(Transition {
            action: Action::CompleteCycle,
            next: WorkflowState::Idle,
        }),
        _ => None,
    }
}

/// Read-only view of the workflow state. Cheap to clone; any number of
/// readers can hold one while the dispatch loop writes.
#[derive(Debug, Clone)]
pub struct StateHandle {
    rx: watch::Receiver<WorkflowState>,
}

impl StateHandle {
    pub(crate) fn new(rx: watch::Receiver<WorkflowState>) -> Self {
        Self { rx }
    }

    pub fn get(&self) -> WorkflowState {
        *self.rx.borrow()
    }

    /// Waits until `predicate` holds for the current state or `limit`
    /// elapses. Returns the matching state, or `None` on timeout or when the
    /// orchestrator has gone away.
    pub async fn wait_for<F>(&self, limit: Duration, mut predicate: F) -> Option<WorkflowState>
    where
        F: FnMut(WorkflowState) -> bool,
    {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(limit, rx.wait_for(|state| predicate(*state))).await;
        match waited {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}
