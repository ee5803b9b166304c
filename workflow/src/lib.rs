mod layout;
mod machine;
mod orchestrator;
mod state;
mod supervisor;
mod watch;

pub use layout::COORDINATION_DIR;
pub use layout::CoordinationLayout;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorOptions;
pub use state::Action;
pub use state::Stage;
pub use state::StateHandle;
pub use state::Transition;
pub use state::Trigger;
pub use state::WorkflowState;
pub use state::transition;
pub use supervisor::ProcessSupervisor;
pub use supervisor::StageError;
pub use supervisor::StageExit;
pub use supervisor::StageOutcome;
pub use watch::WatchEvent;
pub use watch::WatchSource;
