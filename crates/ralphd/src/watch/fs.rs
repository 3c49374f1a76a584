//! Local watch driver: native file notifications batched over a settle window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeKind, IncrementalReconciler};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Changes collected during one settle window, deduplicated per path.
/// The last kind seen for a path wins; first-arrival order is kept.
#[derive(Debug, Default)]
pub struct PendingChanges {
    order: Vec<PathBuf>,
    kinds: HashMap<PathBuf, ChangeKind>,
}

impl PendingChanges {
    pub fn push(&mut self, path: PathBuf, kind: ChangeKind) {
        if self.kinds.insert(path.clone(), kind).is_none() {
            self.order.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn drain(&mut self) -> Vec<(PathBuf, ChangeKind)> {
        let mut kinds = std::mem::take(&mut self.kinds);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|path| kinds.remove(&path).map(|kind| (path, kind)))
            .collect()
    }
}

/// Map one notify event onto path-level changes.
///
/// Renames are resolved by checking whether the path still exists, since
/// platforms disagree on which side of a rename they report.
pub fn translate(event: &NotifyEvent) -> Vec<(PathBuf, ChangeKind)> {
    let by_existence = |path: &PathBuf| {
        if path.exists() {
            ChangeKind::Changed
        } else {
            ChangeKind::Removed
        }
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), ChangeKind::Added))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), ChangeKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), ChangeKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), ChangeKind::Added))
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), by_existence(p)))
            .collect(),
        EventKind::Modify(_) | EventKind::Any => event
            .paths
            .iter()
            .map(|p| (p.clone(), by_existence(p)))
            .collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

/// Rewrite `path` from the watcher's canonical root onto the layout root.
fn rebase(path: &Path, canonical_root: &Path, layout_root: &Path) -> PathBuf {
    match path.strip_prefix(canonical_root) {
        Ok(rest) => layout_root.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Watch the artifact root until `cancel` fires.
pub async fn run(
    mut tracker: IncrementalReconciler,
    settle: Duration,
    cancel: CancellationToken,
) -> Result<(), WatchError> {
    let layout_root = tracker.reconciler().layout().root().to_path_buf();
    if !layout_root.exists() {
        info!(path = %layout_root.display(), "creating artifact directory");
        tokio::fs::create_dir_all(&layout_root).await?;
    }
    let canonical_root = tokio::fs::canonicalize(&layout_root).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<NotifyEvent>();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(&canonical_root, RecursiveMode::Recursive)?;
    info!(path = %canonical_root.display(), "watching artifact directory");

    if let Err(e) = tracker.prime().await {
        warn!(error = %e, "failed to prime change tracker");
    }

    let mut pending = PendingChanges::default();
    let mut flush_tick = tokio::time::interval(settle.max(Duration::from_millis(10)));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("file watcher stopping");
                break;
            }
            Some(event) = rx.recv() => {
                for (path, kind) in translate(&event) {
                    pending.push(rebase(&path, &canonical_root, &layout_root), kind);
                }
            }
            _ = flush_tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                debug!(changes = pending.len(), "applying batched changes");
                for (path, kind) in pending.drain() {
                    tracker.handle_change(&path, kind).await;
                }
            }
        }
    }

    drop(watcher);
    Ok(())
}
