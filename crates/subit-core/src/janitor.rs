//! Best-effort cleanup of uploads and scratch files.
//!
//! A just-terminated decoder may still hold a handle on the file it was reading,
//! so deletions that report "in use" are retried with a short backoff. Anything
//! that still cannot be removed is logged and skipped; cleanup never fails its caller.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for paths that are still held open by another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorConfig {
    /// Extra attempts after the first one (only for "in use" failures).
    pub retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Targets that were already gone.
    pub missing: Vec<PathBuf>,
    /// Targets that could not be removed after retries.
    pub failed: Vec<PathBuf>,
    /// The survivor, if it was among the targets.
    pub kept: Option<PathBuf>,
}

enum Removal {
    Removed,
    Missing,
    Failed(io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct Janitor {
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(config: JanitorConfig) -> Self {
        Self { config }
    }

    /// Delete every file or directory in `paths` except `keep`.
    pub fn cleanup<I, P>(&self, paths: I, keep: Option<&Path>) -> CleanupReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.cleanup_with(paths, keep, remove_path)
    }

    fn cleanup_with<I, P, R>(&self, paths: I, keep: Option<&Path>, mut remove: R) -> CleanupReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        R: FnMut(&Path) -> io::Result<()>,
    {
        let mut report = CleanupReport::default();
        for path in paths {
            let path = path.as_ref();
            if keep.is_some_and(|k| same_path(k, path)) {
                report.kept = Some(path.to_path_buf());
                continue;
            }
            match self.remove_with_retry(path, &mut remove) {
                Removal::Removed => {
                    debug!(target: "subit::janitor", "removed {}", path.display());
                    report.removed.push(path.to_path_buf());
                }
                Removal::Missing => report.missing.push(path.to_path_buf()),
                Removal::Failed(e) => {
                    warn!(target: "subit::janitor", "could not remove {}: {}", path.display(), e);
                    report.failed.push(path.to_path_buf());
                }
            }
        }
        report
    }

    /// Delete every entry directly inside `dir` except `keep`. The directory itself stays.
    pub fn sweep_dir(&self, dir: &Path, keep: Option<&Path>) -> CleanupReport {
        let entries = match std::fs::read_dir(dir) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect::<Vec<_>>(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(target: "subit::janitor", "could not list {}: {}", dir.display(), e);
                Vec::new()
            }
        };
        self.cleanup(entries, keep)
    }

    fn remove_with_retry<R>(&self, path: &Path, remove: &mut R) -> Removal
    where
        R: FnMut(&Path) -> io::Result<()>,
    {
        let mut attempt: u32 = 0;
        loop {
            match remove(path) {
                Ok(()) => return Removal::Removed,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Removal::Missing,
                Err(e) if is_in_use(&e) && attempt < self.config.retries => {
                    attempt += 1;
                    debug!(
                        target: "subit::janitor",
                        "{} still in use, retry {}/{}",
                        path.display(),
                        attempt,
                        self.config.retries
                    );
                    thread::sleep(self.config.backoff * attempt);
                }
                Err(e) => return Removal::Failed(e),
            }
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}

/// Transient "file is held by another process" conditions.
fn is_in_use(err: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        matches!(err.raw_os_error(), Some(32) | Some(33))
            || err.kind() == io::ErrorKind::PermissionDenied
    }
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::EBUSY) | Some(libc::ETXTBSY))
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn removes_all_but_keep() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b_audio.wav");
        let keep = dir.path().join("keep.mp4");
        for p in [&a, &b, &keep] {
            fs::write(p, b"x").unwrap();
        }

        let report = Janitor::default().cleanup([&a, &b, &keep], Some(keep.as_path()));
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(keep.exists());
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.kept.as_deref(), Some(keep.as_path()));
    }

    #[test]
    fn missing_paths_are_not_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("ghost.mp4");
        let report = Janitor::default().cleanup([&ghost], None);
        assert_eq!(report.missing, vec![ghost]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(scratch.join("nested")).unwrap();
        fs::write(scratch.join("nested").join("seg_0.wav"), b"x").unwrap();
        let report = Janitor::default().cleanup([&scratch], None);
        assert!(!scratch.exists());
        assert_eq!(report.removed.len(), 1);
    }

    #[test]
    fn sweep_dir_keeps_survivor_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.mkv");
        let new = dir.path().join("new.mkv");
        fs::write(&old, b"x").unwrap();
        fs::write(&new, b"x").unwrap();
        let janitor = Janitor::new(JanitorConfig {
            retries: 0,
            backoff: Duration::ZERO,
        });
        janitor.sweep_dir(dir.path(), Some(new.as_path()));
        assert!(dir.path().exists());
        assert!(!old.exists());
        assert!(new.exists());
    }

    fn no_backoff(retries: u32) -> Janitor {
        Janitor::new(JanitorConfig {
            retries,
            backoff: Duration::ZERO,
        })
    }

    #[cfg(unix)]
    #[test]
    fn busy_paths_are_retried_then_reported_failed() {
        let target = PathBuf::from("/scratch/held.wav");
        let mut attempts = 0;
        let report = no_backoff(3).cleanup_with([&target], None, |_| {
            attempts += 1;
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        });
        assert_eq!(attempts, 4);
        assert_eq!(report.failed, vec![target]);
        assert!(report.removed.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn busy_path_released_during_retries_is_removed() {
        let target = PathBuf::from("/scratch/held.wav");
        let mut attempts = 0;
        let report = no_backoff(3).cleanup_with([&target], None, |_| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from_raw_os_error(libc::ETXTBSY))
            } else {
                Ok(())
            }
        });
        assert_eq!(attempts, 3);
        assert_eq!(report.removed, vec![target]);
        assert!(report.failed.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn permission_denied_is_not_retried() {
        let target = PathBuf::from("/scratch/locked.mp4");
        let mut attempts = 0;
        let report = no_backoff(3).cleanup_with([&target], None, |_| {
            attempts += 1;
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert_eq!(attempts, 1);
        assert_eq!(report.failed, vec![target]);
    }

    #[test]
    fn sweep_of_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = Janitor::default().sweep_dir(&dir.path().join("nope"), None);
        assert_eq!(report, CleanupReport::default());
    }
}
