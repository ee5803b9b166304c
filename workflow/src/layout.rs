use crate::state::Stage;
use crate::state::Trigger;
use anyhow::Context;
use chrono::SecondsFormat;
use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::warn;

/// Name of the coordination directory inside the working directory.
pub const COORDINATION_DIR: &str = ".orchestration-coordination";

/// Paths shared between the orchestrator, the stage programs and operators.
#[derive(Debug, Clone)]
pub struct CoordinationLayout {
    work_dir: PathBuf,
    coord_dir: PathBuf,
}

impl CoordinationLayout {
    pub fn new(work_dir: PathBuf) -> Self {
        let coord_dir = work_dir.join(COORDINATION_DIR);
        Self {
            work_dir,
            coord_dir,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn coordination_dir(&self) -> &Path {
        &self.coord_dir
    }

    pub fn ensure_directory(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.coord_dir)
            .with_context(|| format!("failed to create {}", self.coord_dir.display()))
    }

    pub fn marker_path(&self, trigger: Trigger) -> PathBuf {
        self.coord_dir.join(trigger.file_name())
    }

    pub fn stage_script(&self, stage: Stage) -> PathBuf {
        self.work_dir.join(stage.script_name())
    }

    /// Creates every missing marker as an empty file. Existing markers keep
    /// their content. A marker that cannot be created is logged and skipped.
    pub fn ensure_markers(&self) {
        for trigger in Trigger::ALL {
            let path = self.marker_path(trigger);
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path);
            match created {
                Ok(_) => debug!(marker = %trigger, "created empty marker"),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to create marker"
                ),
            }
        }
    }

    /// Replaces the marker's content with a fresh timestamp, which is what
    /// signals the edge to the watcher.
    pub fn touch(&self, trigger: Trigger) -> anyhow::Result<()> {
        let path = self.marker_path(trigger);
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        fs::write(&path, format!("triggered at {stamp}\n"))
            .with_context(|| format!("failed to touch {}", path.display()))
    }
}
