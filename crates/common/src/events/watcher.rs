use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use super::{EventLog, FsEventKind};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("{0} does not exist, can't watch")]
    MissingRoot(PathBuf),
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Map a notify event kind onto ours. Access notifications are dropped.
fn classify(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Create),
        EventKind::Remove(_) => Some(FsEventKind::Remove),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(FsEventKind::Chmod),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsEventKind::Rename),
        EventKind::Modify(_) | EventKind::Any => Some(FsEventKind::Write),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// `path` relative to `root`, joined with `/` regardless of platform.
pub fn relative_event_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Watch `root` recursively, recording every change into `log` until
/// `shutdown` fires. Watcher errors are logged and do not stop the loop.
pub async fn run(
    root: PathBuf,
    log: Arc<EventLog>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), WatchError> {
    if !root.exists() {
        return Err(WatchError::MissingRoot(root));
    }
    let root = std::fs::canonicalize(&root).unwrap_or(root);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), "watching for filesystem changes");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!("filesystem watcher shutting down");
                break;
            }
            received = rx.recv() => {
                let Some(res) = received else { break };
                match res {
                    Ok(event) => {
                        let Some(kind) = classify(&event.kind) else { continue };
                        for path in &event.paths {
                            let relative = relative_event_path(&root, path);
                            tracing::trace!(path = %relative, %kind, "filesystem event");
                            log.record(relative, kind);
                        }
                    }
                    Err(e) => tracing::error!("filesystem watcher error: {}", e),
                }
            }
        }
    }

    drop(watcher);
    Ok(())
}
