use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::{FileTime, set_file_mtime};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Modification time in UTC epoch seconds, or 0 when the platform hides it.
pub fn mtime_unix(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stamps a local path with the remote entry's modification time.
pub fn set_local_mtime(path: &Path, modified_at: i64) -> std::io::Result<()> {
    set_file_mtime(path, FileTime::from_unix_time(modified_at, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stamps_and_reads_back_mtime() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        set_local_mtime(&file, 1_704_067_200).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(mtime_unix(&meta), 1_704_067_200);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_unix() > 1_577_836_800);
    }
}
