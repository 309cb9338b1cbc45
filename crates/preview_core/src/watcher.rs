//! Filesystem watch sets tied to a preview session's asset set.
//!
//! Each target gets its own watcher on the target's parent directory, so a
//! file that is deleted and recreated (editors writing via rename) or that
//! does not exist yet is still observed. When the parent directory is missing
//! too, the nearest existing ancestor is watched recursively instead. A target
//! that can not be watched is skipped, the rest of the set is installed
//! regardless.

use crate::error::PreviewError;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type WatchSetId = u64;

/// What a watched file means to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// The workspace configuration file.
    Config,
    /// A stylesheet, script or initializer loaded by the page.
    Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub kind: TargetKind,
}

impl WatchTarget {
    pub fn new(path: impl Into<PathBuf>, kind: TargetKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// Events emitted by an installed watch set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Set the event originates from, used to drop events of replaced sets.
    pub set_id: WatchSetId,
    pub path: PathBuf,
    pub target: TargetKind,
    pub change: ChangeKind,
}

/// Installs and disposes watch sets, forwarding their events to one channel.
#[derive(Debug, Clone)]
pub struct WatcherRegistry {
    event_tx: UnboundedSender<WatchEvent>,
    next_set_id: Arc<AtomicU64>,
    /// Number of watch handles currently alive across all sets.
    live: Arc<AtomicUsize>,
}

impl WatcherRegistry {
    pub fn new(event_tx: UnboundedSender<WatchEvent>) -> Self {
        Self {
            event_tx,
            next_set_id: Arc::new(AtomicU64::new(1)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Installs a watcher for each target.
    ///
    /// Does not touch any previously installed set, disposing it is up to the
    /// caller.
    pub fn install(&self, targets: Vec<WatchTarget>) -> WatchSet {
        let id = self.next_set_id.fetch_add(1, Ordering::SeqCst);
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            match FileWatcher::new(target.clone(), id, self.event_tx.clone(), self.live.clone()) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::warn!(?err, path = ?target.path, "Skipping unwatchable target");
                }
            }
        }

        tracing::debug!(set_id = id, watched = handles.len(), "Installed watch set");

        WatchSet { id, handles }
    }

    pub fn dispose_all(&self, set: WatchSet) {
        tracing::debug!(set_id = set.id, watched = set.len(), "Disposing watch set");
        drop(set);
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// The watchers installed for one asset set. Dropping it stops them all.
#[derive(Debug)]
pub struct WatchSet {
    id: WatchSetId,
    handles: Vec<FileWatcher>,
}

impl WatchSet {
    pub fn id(&self) -> WatchSetId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = &WatchTarget> {
        self.handles.iter().map(|handle| &handle.target)
    }
}

/// A watcher for a single file.
struct FileWatcher {
    /// Kept alive for as long as the file should be watched.
    _watcher: RecommendedWatcher,
    target: WatchTarget,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("target", &self.target)
            .finish()
    }
}

impl FileWatcher {
    fn new(
        target: WatchTarget,
        set_id: WatchSetId,
        event_tx: UnboundedSender<WatchEvent>,
        live: Arc<AtomicUsize>,
    ) -> Result<Self, PreviewError> {
        let location = WatchLocation::of(&target.path)?;
        let suffix = location.suffix;

        let event_target = target.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    // Filter events to only our target file
                    let is_target_file = event.paths.iter().any(|p| p.ends_with(&suffix));

                    if !is_target_file {
                        return;
                    }

                    let change = if event.kind.is_create() {
                        ChangeKind::Created
                    } else if event.kind.is_remove() {
                        ChangeKind::Removed
                    } else if event.kind.is_modify() {
                        ChangeKind::Modified
                    } else {
                        return;
                    };

                    let _ = event_tx.send(WatchEvent {
                        set_id,
                        path: event_target.path.clone(),
                        target: event_target.kind,
                        change,
                    });
                }
                Err(e) => {
                    tracing::error!(?e, "File watcher error");
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(&location.dir, location.mode)?;

        live.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            _watcher: watcher,
            target,
            live,
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The directory a target is watched from.
#[derive(Debug, PartialEq, Eq)]
struct WatchLocation {
    dir: PathBuf,
    mode: RecursiveMode,
    /// Trailing components an event path must end with to concern the target.
    suffix: PathBuf,
}

impl WatchLocation {
    fn of(path: &Path) -> Result<Self, PreviewError> {
        let invalid = || PreviewError::InvalidWatchTarget(path.to_path_buf());

        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => (parent, name),
            _ => return Err(invalid()),
        };

        if parent.is_dir() {
            return Ok(Self {
                dir: parent.to_path_buf(),
                mode: RecursiveMode::NonRecursive,
                suffix: PathBuf::from(name),
            });
        }

        // Never fall back to watching the filesystem root.
        let ancestor = parent
            .ancestors()
            .skip(1)
            .find(|dir| dir.parent().is_some() && dir.is_dir())
            .ok_or_else(invalid)?;
        let suffix = path.strip_prefix(ancestor).map_err(|_| invalid())?;

        Ok(Self {
            dir: ancestor.to_path_buf(),
            mode: RecursiveMode::Recursive,
            suffix: suffix.to_path_buf(),
        })
    }
}

/// Collapses a burst of events into at most one event per watch set.
///
/// A configuration change wins over asset changes of the same set since it
/// triggers the larger refresh.
pub fn coalesce(events: impl IntoIterator<Item = WatchEvent>) -> Vec<WatchEvent> {
    let mut latest: BTreeMap<WatchSetId, WatchEvent> = BTreeMap::new();
    for event in events {
        match latest.get(&event.set_id) {
            Some(existing)
                if existing.target == TargetKind::Config && event.target == TargetKind::Asset => {}
            _ => {
                latest.insert(event.set_id, event);
            }
        }
    }
    latest.into_values().collect()
}
