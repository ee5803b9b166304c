use crate::state::Stage;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage script not found at {}", .path.display())]
    ScriptMissing { path: PathBuf },

    #[error("stage script {} is not executable", .path.display())]
    NotExecutable { path: PathBuf },

    #[error("failed to start {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{running} stage process is still running")]
    SlotBusy { running: Stage },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed { code: Option<i32> },
    WaitFailed { message: String },
}

impl StageOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            StageOutcome::Succeeded
        } else {
            StageOutcome::Failed {
                code: status.code(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Succeeded)
    }
}

/// Reported once per managed process when it exits on its own.
#[derive(Debug, Clone)]
pub struct StageExit {
    pub id: u64,
    pub stage: Stage,
    pub script: PathBuf,
    pub outcome: StageOutcome,
}

#[derive(Debug)]
struct ManagedProcess {
    id: u64,
    stage: Stage,
    script: PathBuf,
    pid: Option<u32>,
    kill: CancellationToken,
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<ManagedProcess>,
    next_id: u64,
}

/// Owns the single process slot. Launches stage programs, watches each one
/// from its own task and reports exits on a channel.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    work_dir: PathBuf,
    slot: Arc<Mutex<Slot>>,
    exits: mpsc::UnboundedSender<StageExit>,
}

impl ProcessSupervisor {
    pub fn new(work_dir: PathBuf) -> (Self, mpsc::UnboundedReceiver<StageExit>) {
        let (exits, exits_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            work_dir,
            slot: Arc::new(Mutex::new(Slot::default())),
            exits,
        };
        (supervisor, exits_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches `script` with `args`, running in the working directory with
    /// inherited stdout/stderr. Must be called from within a tokio runtime.
    /// Returns the id later carried by the matching [`StageExit`].
    pub fn start_stage(
        &self,
        stage: Stage,
        script: &Path,
        args: &[OsString],
    ) -> Result<u64, StageError> {
        let mut slot = self.lock();
        if let Some(running) = &slot.current {
            return Err(StageError::SlotBusy {
                running: running.stage,
            });
        }

        check_script(script)?;

        let mut cmd = Command::new(script);
        cmd.args(args);
        cmd.current_dir(&self.work_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| StageError::Spawn {
            path: script.to_path_buf(),
            source,
        })?;

        slot.next_id += 1;
        let id = slot.next_id;
        let pid = child.id();
        let kill = CancellationToken::new();
        info!(%stage, script = %script.display(), ?pid, "stage process started");

        slot.current = Some(ManagedProcess {
            id,
            stage,
            script: script.to_path_buf(),
            pid,
            kill: kill.clone(),
        });
        drop(slot);

        tokio::spawn(supervise(
            child,
            id,
            stage,
            script.to_path_buf(),
            kill,
            self.exits.clone(),
        ));
        Ok(id)
    }

    /// Clears the slot if it still holds the process that produced `exit`.
    pub fn reap(&self, exit: &StageExit) -> bool {
        let mut slot = self.lock();
        let current = slot
            .current
            .as_ref()
            .is_some_and(|process| process.id == exit.id);
        if current {
            slot.current = None;
        }
        current
    }

    pub fn running_stage(&self) -> Option<Stage> {
        self.lock().current.as_ref().map(|process| process.stage)
    }

    /// Signals the live process, if any, before returning and frees the slot
    /// without waiting for the process to go away. No exit is reported for it.
    pub fn stop(&self) {
        let taken = self.lock().current.take();
        if let Some(process) = taken {
            info!(
                stage = %process.stage,
                script = %process.script.display(),
                pid = ?process.pid,
                "terminating stage process"
            );
            terminate(&process);
            process.kill.cancel();
        }
    }
}

#[cfg(unix)]
fn terminate(process: &ManagedProcess) {
    use nix::sys::signal::Signal;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = process.pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(stage = %process.stage, pid, error = %err, "failed to signal stage process");
    }
}

// Without unix signals the supervise task kills the child once cancelled.
#[cfg(not(unix))]
fn terminate(_process: &ManagedProcess) {}

fn check_script(script: &Path) -> Result<(), StageError> {
    let metadata = match std::fs::metadata(script) {
        Ok(metadata) => metadata,
        Err(_) => {
            return Err(StageError::ScriptMissing {
                path: script.to_path_buf(),
            });
        }
    };
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(StageError::NotExecutable {
            path: script.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

async fn supervise(
    mut child: Child,
    id: u64,
    stage: Stage,
    script: PathBuf,
    kill: CancellationToken,
    exits: mpsc::UnboundedSender<StageExit>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => StageOutcome::from_status(status),
            Err(err) => StageOutcome::WaitFailed { message: err.to_string() },
        },
        _ = kill.cancelled() => {
            if cfg!(not(unix)) {
                if let Err(err) = child.start_kill() {
                    warn!(%stage, error = %err, "failed to kill stage process");
                }
            }
            // Reap the stopped child. If the runtime goes away first,
            // kill_on_drop takes it down.
            let _ = child.wait().await;
            return;
        }
    };

    match &outcome {
        StageOutcome::Succeeded => {
            info!(%stage, script = %script.display(), "stage process completed successfully");
        }
        StageOutcome::Failed { code } => {
            error!(%stage, script = %script.display(), ?code, "stage process failed");
        }
        StageOutcome::WaitFailed { message } => {
            error!(%stage, script = %script.display(), error = %message, "lost track of stage process");
        }
    }

    // The receiver is gone once the orchestrator has shut down.
    let _ = exits.send(StageExit {
        id,
        stage,
        script,
        outcome,
    });
}
