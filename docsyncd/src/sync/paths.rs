use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const LIBRARY_SEGMENT: &str = "documentLibrary";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("{path} is outside the watched folder {root}")]
    OutOfScope { path: String, root: String },
}

/// Local subtree mirrored by one watch mapping:
/// `<sync_path>/<site_id>/<watch folder below the document library>`.
///
/// A watch folder outside any document library maps to its last segment.
pub fn watcher_local_root(
    sync_path: &Path,
    site_id: &str,
    watch_folder: &str,
) -> Result<PathBuf, PathError> {
    let segments: Vec<&str> = watch_folder.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    let tail = match segments.iter().position(|s| *s == LIBRARY_SEGMENT) {
        Some(index) => segments[index + 1..].join("/"),
        None => segments[segments.len() - 1].to_string(),
    };
    let mut root = join_relative(sync_path, site_id)?;
    if !tail.is_empty() {
        root = join_relative(&root, &tail)?;
    }
    Ok(root)
}

/// Maps a POSIX-style relative path under `root`, rejecting `..` and prefixes.
pub fn join_relative(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Part of `remote_path` below `watch_folder`; empty for the folder itself.
pub fn remote_relative<'a>(watch_folder: &str, remote_path: &'a str) -> Option<&'a str> {
    let base = watch_folder.trim_end_matches('/');
    let rest = remote_path.strip_prefix(base)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

/// Expected local path of a remote entry named `name` inside `parent_path`.
pub fn local_path_for_remote(
    local_root: &Path,
    watch_folder: &str,
    parent_path: &str,
    name: &str,
) -> Result<PathBuf, PathError> {
    let relative_parent =
        remote_relative(watch_folder, parent_path).ok_or_else(|| PathError::OutOfScope {
            path: parent_path.to_string(),
            root: watch_folder.to_string(),
        })?;
    if name.is_empty() || name.contains('/') || name == ".." || name == "." {
        return Err(PathError::UnsupportedComponent);
    }
    let base = if relative_parent.is_empty() {
        local_root.to_path_buf()
    } else {
        join_relative(local_root, relative_parent)?
    };
    Ok(base.join(name))
}

/// Relative POSIX path of `path` below `root`; empty when they are equal.
pub fn local_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Remote folder path a local folder corresponds to.
pub fn remote_folder_for_local(watch_folder: &str, local_root: &Path, local_folder: &Path) -> Option<String> {
    let relative = local_relative(local_root, local_folder)?;
    let base = watch_folder.trim_end_matches('/');
    if relative.is_empty() {
        Some(base.to_string())
    } else {
        Some(format!("{base}/{relative}"))
    }
}

pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Index key for a local path.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// In-flight download targets carry this suffix until renamed into place.
pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = "/Company Home/Sites/finance/documentLibrary";

    #[test]
    fn local_root_uses_segments_below_library() {
        let root = watcher_local_root(
            Path::new("/home/u/Docs"),
            "finance",
            &format!("{LIBRARY}/reports/2024"),
        )
        .unwrap();
        assert_eq!(root, PathBuf::from("/home/u/Docs/finance/reports/2024"));

        let root = watcher_local_root(Path::new("/home/u/Docs"), "finance", LIBRARY).unwrap();
        assert_eq!(root, PathBuf::from("/home/u/Docs/finance"));
    }

    #[test]
    fn local_root_outside_library_uses_last_segment() {
        let root =
            watcher_local_root(Path::new("/sync"), "home", "/Company Home/User Homes/alice")
                .unwrap();
        assert_eq!(root, PathBuf::from("/sync/home/alice"));
        assert_eq!(
            watcher_local_root(Path::new("/sync"), "home", "/"),
            Err(PathError::Empty)
        );
    }

    #[test]
    fn maps_remote_entry_under_local_root() {
        let root = PathBuf::from("/sync/finance");
        let mapped =
            local_path_for_remote(&root, LIBRARY, &format!("{LIBRARY}/docs"), "a.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/sync/finance/docs/a.txt"));

        let top = local_path_for_remote(&root, LIBRARY, LIBRARY, "docs").unwrap();
        assert_eq!(top, PathBuf::from("/sync/finance/docs"));
    }

    #[test]
    fn rejects_entries_outside_scope_or_with_parent_components() {
        let root = PathBuf::from("/sync/finance");
        assert!(matches!(
            local_path_for_remote(&root, LIBRARY, "/Company Home/Other", "a.txt"),
            Err(PathError::OutOfScope { .. })
        ));
        assert_eq!(
            local_path_for_remote(&root, LIBRARY, LIBRARY, ".."),
            Err(PathError::UnsupportedComponent)
        );
        assert_eq!(
            join_relative(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        );
    }

    #[test]
    fn sibling_prefix_is_not_in_scope() {
        assert_eq!(remote_relative("/a/docs", "/a/docs-old/x"), None);
        assert_eq!(remote_relative("/a/docs", "/a/docs/x/y"), Some("x/y"));
        assert_eq!(remote_relative("/a/docs/", "/a/docs"), Some(""));
    }

    #[test]
    fn remote_folder_mirrors_local_folder() {
        let root = PathBuf::from("/sync/finance");
        assert_eq!(
            remote_folder_for_local(LIBRARY, &root, &root.join("docs/2024")),
            Some(format!("{LIBRARY}/docs/2024"))
        );
        assert_eq!(
            remote_folder_for_local(LIBRARY, &root, &root),
            Some(LIBRARY.to_string())
        );
        assert_eq!(remote_folder_for_local(LIBRARY, &root, Path::new("/elsewhere")), None);
    }

    #[test]
    fn partial_suffix_round_trip() {
        let target = PathBuf::from("/sync/a.tar.gz");
        let partial = partial_path(&target);
        assert_eq!(partial, PathBuf::from("/sync/a.tar.gz.partial"));
        assert!(is_partial(&partial));
        assert!(!is_partial(&target));
    }
}
