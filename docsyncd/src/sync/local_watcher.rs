use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::clock::mtime_unix;
use super::paths::is_partial;

/// Logical change after debouncing and stat comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChange {
    Created,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: PathBuf,
    pub change: FsChange,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub is_dir: bool,
    pub len: u64,
    pub mtime: i64,
}

impl Snapshot {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        Some(Self {
            is_dir: meta.is_dir(),
            len: if meta.is_dir() { 0 } else { meta.len() },
            mtime: mtime_unix(&meta),
        })
    }
}

pub fn classify(previous: Option<&Snapshot>, current: Option<&Snapshot>) -> Option<FsChange> {
    match (previous, current) {
        (None, Some(_)) => Some(FsChange::Created),
        (Some(_), None) => Some(FsChange::Removed),
        // Type swap at the same path reads as a fresh create.
        (Some(prev), Some(cur)) if prev.is_dir != cur.is_dir => Some(FsChange::Created),
        (Some(prev), Some(_)) if prev.is_dir => None,
        (Some(prev), Some(cur)) => (prev != cur).then_some(FsChange::Changed),
        (None, None) => None,
    }
}

/// Remembers the last stat of every path under a root so debounced raw
/// notifications can be turned into created/changed/removed events.
#[derive(Debug, Default)]
pub struct ChangeClassifier {
    snapshots: HashMap<PathBuf, Snapshot>,
}

impl ChangeClassifier {
    /// Records the current tree so pre-existing entries are not reported as
    /// created on their first notification.
    pub fn prime(root: &Path) -> Self {
        let mut snapshots = HashMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if is_partial(&path) {
                    continue;
                }
                if let Some(snapshot) = Snapshot::of(&path) {
                    if snapshot.is_dir {
                        pending.push(path.clone());
                    }
                    snapshots.insert(path, snapshot);
                }
            }
        }
        Self { snapshots }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn observe(&mut self, path: &Path) -> Option<LocalEvent> {
        let current = Snapshot::of(path);
        let previous = self.snapshots.get(path).copied();
        let change = classify(previous.as_ref(), current.as_ref())?;

        match current {
            Some(snapshot) => {
                self.snapshots.insert(path.to_path_buf(), snapshot);
            }
            None => {
                self.snapshots.retain(|known, _| !known.starts_with(path));
            }
        }

        let is_dir = current.or(previous).is_some_and(|s| s.is_dir);
        Some(LocalEvent {
            path: path.to_path_buf(),
            change,
            is_dir,
        })
    }
}

/// Recursively watches `root`, forwarding every touched path.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for path in touched_paths(&watch_root, event) {
                let _ = tx.send(path);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn touched_paths(root: &Path, event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter(|path| path.starts_with(root) && path != root && !is_partial(path))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RenameMode};
    use tempfile::tempdir;

    fn snap(is_dir: bool, len: u64, mtime: i64) -> Snapshot {
        Snapshot { is_dir, len, mtime }
    }

    #[test]
    fn classifies_stat_transitions() {
        let file = snap(false, 3, 100);
        assert_eq!(classify(None, Some(&file)), Some(FsChange::Created));
        assert_eq!(classify(Some(&file), None), Some(FsChange::Removed));
        assert_eq!(classify(Some(&file), Some(&file)), None);
        assert_eq!(
            classify(Some(&file), Some(&snap(false, 4, 101))),
            Some(FsChange::Changed)
        );
        assert_eq!(
            classify(Some(&file), Some(&snap(true, 0, 100))),
            Some(FsChange::Created)
        );
        // Folder mtimes move whenever children change; that is not an edit.
        assert_eq!(classify(Some(&snap(true, 0, 1)), Some(&snap(true, 0, 2))), None);
        assert_eq!(classify(None, None), None);
    }

    #[test]
    fn primed_entries_report_changes_not_creates() {
        let dir = tempdir().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        let file = docs.join("a.txt");
        std::fs::write(&file, b"one").unwrap();

        let mut classifier = ChangeClassifier::prime(dir.path());
        assert_eq!(classifier.len(), 2);
        assert_eq!(classifier.observe(&file), None);

        std::fs::write(&file, b"longer").unwrap();
        let event = classifier.observe(&file).unwrap();
        assert_eq!(event.change, FsChange::Changed);
        assert!(!event.is_dir);

        let fresh = docs.join("b.txt");
        std::fs::write(&fresh, b"new").unwrap();
        assert_eq!(classifier.observe(&fresh).unwrap().change, FsChange::Created);
    }

    #[test]
    fn removing_a_folder_forgets_descendants() {
        let dir = tempdir().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join("sub")).unwrap();
        std::fs::write(docs.join("sub/a.txt"), b"x").unwrap();
        let mut classifier = ChangeClassifier::prime(dir.path());
        assert_eq!(classifier.len(), 3);

        std::fs::remove_dir_all(&docs).unwrap();
        let event = classifier.observe(&docs).unwrap();

        assert_eq!(event.change, FsChange::Removed);
        assert!(event.is_dir);
        assert!(classifier.is_empty());
        assert_eq!(classifier.observe(&docs.join("sub/a.txt")), None);
    }

    #[test]
    fn touched_paths_skip_partials_and_root() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![
                PathBuf::from("/tmp/root/docs/a.txt.partial"),
                PathBuf::from("/tmp/root/docs/a.txt"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            touched_paths(root, event),
            vec![PathBuf::from("/tmp/root/docs/a.txt")]
        );

        let event = Event {
            kind: EventKind::Create(CreateKind::Folder),
            paths: vec![PathBuf::from("/tmp/root"), PathBuf::from("/elsewhere/x")],
            attrs: Default::default(),
        };
        assert!(touched_paths(root, event).is_empty());

        let event = Event {
            kind: EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            paths: vec![PathBuf::from("/tmp/root/b.txt")],
            attrs: Default::default(),
        };
        assert_eq!(touched_paths(root, event), vec![PathBuf::from("/tmp/root/b.txt")]);
    }
}
