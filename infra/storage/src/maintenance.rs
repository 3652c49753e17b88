use crate::engine::TMP_MARKER;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

const STALE_AFTER: Duration = Duration::from_secs(300);

/// Removes temporary files older than [`STALE_AFTER`]. Directories are left alone: an empty
/// directory is meaningful to callers.
pub(crate) fn purge_tmp(root: &Path) -> usize {
    let (removed, failed) = remove_stale(root, SystemTime::now(), STALE_AFTER);
    if removed > 0 || failed > 0 {
        info!(removed, failed, "Cleaned up temporary files");
    }
    removed
}

pub(crate) fn is_tmp_name(name: &OsStr) -> bool {
    name.to_str().is_some_and(|name| name.contains(TMP_MARKER))
}

fn remove_stale(root: &Path, now: SystemTime, threshold: Duration) -> (usize, usize) {
    let mut removed = 0;
    let mut failed = 0;

    WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file() && is_tmp_name(entry.file_name()))
        .filter(|entry| is_stale(entry, now, threshold))
        .for_each(|entry| match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove temp file");
                failed += 1;
            },
        });

    (removed, failed)
}

fn is_stale(entry: &DirEntry, now: SystemTime, threshold: Duration) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|modified| now.duration_since(modified).ok())
        .is_none_or(|age| age > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tmp_files_survive_and_stale_ones_go() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("origin");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join(format!("meta{TMP_MARKER}1")), b"x").expect("tmp");
        std::fs::write(dir.join("meta"), b"y").expect("file");

        assert_eq!(remove_stale(tmp.path(), SystemTime::now(), STALE_AFTER), (0, 0));

        let later = SystemTime::now() + Duration::from_secs(600);
        assert_eq!(remove_stale(tmp.path(), later, STALE_AFTER), (1, 0));
        assert!(dir.join("meta").exists());
        assert!(dir.exists());
    }

    #[test]
    fn tmp_name_detection() {
        assert!(is_tmp_name(OsStr::new("cache.bin.qhubtmp.7")));
        assert!(!is_tmp_name(OsStr::new("cache.bin")));
    }
}
