use anyhow::Context;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use notify::event::ModifyKind;
use std::ffi::OsString;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::trace;
use tracing::warn;

/// A write to some file directly inside the watched directory.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub file_name: OsString,
    pub(crate) kind: EventKind,
}

/// Non-recursive subscription to write events in one directory, delivered
/// in the order the platform reports them.
pub struct WatchSource {
    watcher: Option<RecommendedWatcher>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchSource {
    pub fn subscribe(dir: &Path) -> anyhow::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if !is_write(&event.kind) {
                        trace!(kind = ?event.kind, "ignoring non-write event");
                        return;
                    }
                    for path in &event.paths {
                        let Some(file_name) = path.file_name() else {
                            continue;
                        };
                        // Nobody is listening after close().
                        let _ = tx.send(WatchEvent {
                            file_name: file_name.to_os_string(),
                            kind: event.kind,
                        });
                    }
                }
                Err(err) => warn!(error = %err, "file watcher error"),
            }
        })
        .context("failed to create file watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        Ok(Self {
            watcher: Some(watcher),
            events,
        })
    }

    /// Next write event, or `None` once the source is closed.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if self.watcher.is_none() {
            return None;
        }
        self.events.recv().await
    }

    /// Stops the subscription. Events already queued are discarded.
    pub fn close(&mut self) {
        self.watcher = None;
        self.events.close();
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}
