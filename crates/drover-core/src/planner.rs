//! Source enumeration and batch planning.
//!
//! Expands the caller's copy jobs into one task per file, filters transient
//! lock/cache artifacts, totals sizes, and slices the task list into the
//! fixed-size batches the worker pool claims.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::cancel::CancelFlag;
use crate::errors::{CopyError, CopyResult};
use crate::events::{EngineEvent, EventSink};
use crate::mount::MountCoordinator;
use crate::share_path::{is_share_path, SharePath};

/// Filenames that are normally held open or exclusive by their owning
/// application (browser profiles mostly) and are unsafe or pointless to
/// copy. Exact filename match, not substring.
static SKIP_PATTERNS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "lock",
        "lockfile",
        ".parentlock",
        "parent.lock",
        "SingletonLock",
        "SingletonSocket",
        "SingletonCookie",
        "cookies.sqlite-wal",
        "cookies.sqlite-shm",
        "places.sqlite-wal",
        "places.sqlite-shm",
        "webappsstore.sqlite-wal",
        "webappsstore.sqlite-shm",
    ])
});

/// True if `filename` is a known transient/lock artifact.
pub fn is_protected_filename(filename: &str) -> bool {
    SKIP_PATTERNS.contains(filename)
}

/// True if an OS error message names one of the protected filenames,
/// which downgrades the failure from an error to a skip. The message is
/// split into tokens and each token's final path component is compared
/// exactly, so "deadlock" or "locked" in the message text never matches
/// the bare "lock" entry.
pub fn message_matches_skip_pattern(message: &str) -> bool {
    message
        .split(|c: char| c.is_whitespace() || matches!(c, '\'' | '"' | '(' | ')' | ','))
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.rsplit(['/', '\\']).next())
        .any(is_protected_filename)
}

/// Whether a run reads from the configured sources (backup) or writes back
/// to them (restore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Backup,
    Restore,
}

/// One entry from the caller's job list. `sources` and `destinations` pair
/// positionally; a singleton string is accepted as a one-element list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyJob {
    pub id: String,
    #[serde(default = "default_selected")]
    pub selected: bool,
    #[serde(deserialize_with = "string_or_list")]
    pub sources: Vec<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub destinations: Vec<String>,
}

fn default_selected() -> bool {
    true
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(value) => vec![value],
        StringOrList::Many(values) => values,
    })
}

/// A single file to copy. Paths keep the caller's form, so a share file
/// stays `smb://...` and is resolved by the worker that claims it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    pub source: String,
    pub dest: String,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub batches: Vec<Vec<FileTask>>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Batch size scales with the task count but stays within [50, 200] so
/// batches are neither claim-per-file chatter nor hour-long monopolies.
pub fn batch_size(total_files: usize, workers: usize) -> usize {
    (total_files / (2 * workers.max(1))).clamp(50, 200)
}

pub fn plan(
    jobs: &[CopyJob],
    kind: OperationKind,
    workers: usize,
    mounts: &MountCoordinator,
    events: &EventSink,
    cancel: &CancelFlag,
) -> CopyResult<Plan> {
    let mut tasks = Vec::new();

    for job in jobs.iter().filter(|job| job.selected) {
        if job.sources.len() != job.destinations.len() {
            log::warn!(
                "job {}: {} sources but {} destinations, skipping",
                job.id,
                job.sources.len(),
                job.destinations.len()
            );
            events.emit(EngineEvent::FileError {
                source: job.id.clone(),
                message: "mismatched source/destination lists".to_string(),
            });
            continue;
        }
        for (source, destination) in job.sources.iter().zip(&job.destinations) {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            // Restore runs the configured pairs in reverse.
            let (read, write) = match kind {
                OperationKind::Backup => (source.as_str(), destination.as_str()),
                OperationKind::Restore => (destination.as_str(), source.as_str()),
            };
            expand_source(read, write, mounts, events, cancel, &mut tasks)?;
        }
    }

    let total_files = tasks.len();
    let total_bytes = tasks.iter().map(|task| task.size).sum();
    let size = batch_size(total_files, workers);
    let batches = tasks
        .chunks(size)
        .map(|chunk| chunk.to_vec())
        .collect();

    Ok(Plan {
        batches,
        total_files,
        total_bytes,
    })
}

fn expand_source(
    read: &str,
    write: &str,
    mounts: &MountCoordinator,
    events: &EventSink,
    cancel: &CancelFlag,
    tasks: &mut Vec<FileTask>,
) -> CopyResult<()> {
    if is_share_path(read) {
        let parsed = match SharePath::parse(read) {
            Ok(parsed) => parsed,
            Err(err) => {
                events.emit(EngineEvent::FileError {
                    source: read.to_string(),
                    message: err.to_string(),
                });
                return Ok(());
            }
        };
        // A share failure here dooms every other file on the same share, so
        // it propagates instead of degrading to a single error event.
        let local_root = match mounts.resolve(&parsed) {
            Ok(path) => path,
            Err(err) => {
                events.emit(EngineEvent::FileError {
                    source: read.to_string(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };
        let meta = match fs::metadata(&local_root) {
            Ok(meta) => meta,
            Err(err) => {
                events.emit(EngineEvent::FileError {
                    source: read.to_string(),
                    message: err.to_string(),
                });
                return Err(CopyError::Io(err));
            }
        };
        if meta.is_dir() {
            walk_directory(&local_root, write, events, cancel, tasks, |rel| {
                let mut remote = parsed.clone();
                remote.rel = if remote.rel.as_os_str().is_empty() {
                    rel.to_path_buf()
                } else {
                    remote.rel.join(rel)
                };
                remote.display()
            });
        } else {
            push_file_task(read.to_string(), write.to_string(), meta.len(), events, tasks);
        }
        return Ok(());
    }

    let source_path = Path::new(read);
    let meta = match fs::symlink_metadata(source_path) {
        Ok(meta) => meta,
        Err(err) => {
            // Missing or unreadable source: per-file recoverable.
            events.emit(EngineEvent::FileError {
                source: read.to_string(),
                message: err.to_string(),
            });
            return Ok(());
        }
    };

    if meta.is_dir() {
        walk_directory(source_path, write, events, cancel, tasks, |rel| {
            source_path.join(rel).to_string_lossy().into_owned()
        });
    } else {
        push_file_task(read.to_string(), write.to_string(), meta.len(), events, tasks);
    }
    Ok(())
}

/// Walk `root` recursively, mirroring relative structure onto `write`.
/// `source_name` renders a relative path back into the caller's form for
/// task bookkeeping (share paths stay share paths).
fn walk_directory(
    root: &Path,
    write: &str,
    events: &EventSink,
    cancel: &CancelFlag,
    tasks: &mut Vec<FileTask>,
    source_name: impl Fn(&Path) -> String,
) {
    for entry in WalkDir::new(root).follow_links(false) {
        if cancel.is_cancelled() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("enumeration error under {}: {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or_else(|_| entry.path());
        let source = source_name(rel);
        let size = entry.metadata().map(|m| m.len()).unwrap_or_else(|err| {
            log::warn!("could not stat {}: {err}", entry.path().display());
            0
        });
        push_file_task(source, join_destination(write, rel), size, events, tasks);
    }
}

fn push_file_task(
    source: String,
    dest: String,
    size: u64,
    events: &EventSink,
    tasks: &mut Vec<FileTask>,
) {
    let filename = source.rsplit(['/', '\\']).next().unwrap_or(&source);
    if is_protected_filename(filename) {
        events.emit(EngineEvent::FileSkipped {
            source,
            reason: "protected".to_string(),
        });
        return;
    }
    tasks.push(FileTask { source, dest, size });
}

/// Join a relative path onto a destination root that may itself be a share
/// path (string join) or a local path.
fn join_destination(write: &str, rel: &Path) -> String {
    if is_share_path(write) {
        let rel = rel.to_string_lossy().replace('\\', "/");
        format!("{}/{}", write.trim_end_matches('/'), rel)
    } else {
        Path::new(write).join(rel).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSource;
    use crate::mount::{CifsMounter, MountCoordinator};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn local_coordinator(events: EventSink, cancel: CancelFlag) -> MountCoordinator {
        let (credentials, _requests) = CredentialSource::channel();
        MountCoordinator::new(Box::new(CifsMounter::new()), credentials, events, cancel).unwrap()
    }

    fn job(sources: Vec<String>, destinations: Vec<String>) -> CopyJob {
        CopyJob {
            id: "job-1".to_string(),
            selected: true,
            sources,
            destinations,
        }
    }

    #[test]
    fn protected_filenames_are_exact_matches() {
        assert!(is_protected_filename("SingletonLock"));
        assert!(is_protected_filename("cookies.sqlite-wal"));
        assert!(!is_protected_filename("SingletonLock.bak"));
        assert!(!is_protected_filename("cookies.sqlite"));
    }

    #[test]
    fn skip_pattern_message_matching_is_by_filename() {
        assert!(message_matches_skip_pattern(
            "could not open '/home/u/.mozilla/firefox/x/.parentlock'"
        ));
        assert!(message_matches_skip_pattern(
            "failed to read /home/u/.config/chromium/lock"
        ));
        assert!(!message_matches_skip_pattern("permission denied"));
    }

    #[test]
    fn lock_like_words_in_messages_stay_errors() {
        assert!(!message_matches_skip_pattern(
            "Resource deadlock avoided (os error 35)"
        ));
        assert!(!message_matches_skip_pattern(
            "file is locked by another process"
        ));
        assert!(!message_matches_skip_pattern(
            "could not open '/var/lib/locks/db.bin'"
        ));
    }

    #[test]
    fn batch_size_clamps_between_50_and_200() {
        assert_eq!(batch_size(10, 4), 50);
        assert_eq!(batch_size(800, 4), 100);
        assert_eq!(batch_size(1_000_000, 4), 200);
        assert_eq!(batch_size(0, 0), 50);
    }

    #[test]
    fn expands_local_directory_and_mirrors_structure() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("src");
        std::fs::create_dir_all(src_root.join("sub")).unwrap();
        std::fs::write(src_root.join("a.txt"), b"aaaa").unwrap();
        std::fs::write(src_root.join("sub/b.txt"), b"bbbbbb").unwrap();

        let (events, _rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let jobs = vec![job(
            vec![src_root.to_string_lossy().into_owned()],
            vec!["/backup/out".to_string()],
        )];
        let plan = plan(&jobs, OperationKind::Backup, 4, &mounts, &events, &cancel).unwrap();

        assert_eq!(plan.total_files, 2);
        assert_eq!(plan.total_bytes, 10);
        assert_eq!(plan.batches.len(), 1);
        let dests: Vec<&str> = plan.batches[0]
            .iter()
            .map(|t| t.dest.as_str())
            .collect();
        assert!(dests.contains(&"/backup/out/a.txt"));
        assert!(dests.contains(&(PathBuf::from("/backup/out").join("sub/b.txt").to_str().unwrap())));
    }

    #[test]
    fn protected_files_are_skipped_with_event() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("profile");
        std::fs::create_dir_all(&src_root).unwrap();
        std::fs::write(src_root.join("SingletonLock"), b"").unwrap();
        std::fs::write(src_root.join("data.json"), b"{}").unwrap();

        let (events, rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let jobs = vec![job(
            vec![src_root.to_string_lossy().into_owned()],
            vec!["/backup/profile".to_string()],
        )];
        let plan = plan(&jobs, OperationKind::Backup, 2, &mounts, &events, &cancel).unwrap();

        assert_eq!(plan.total_files, 1);
        let skips: Vec<_> = rx
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::FileSkipped { .. }))
            .collect();
        assert_eq!(skips.len(), 1);
    }

    #[test]
    fn restore_swaps_read_and_write_sides() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("original.txt");
        let backup = dir.path().join("backup.txt");
        std::fs::write(&backup, b"restored content").unwrap();

        let (events, _rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let jobs = vec![job(
            vec![original.to_string_lossy().into_owned()],
            vec![backup.to_string_lossy().into_owned()],
        )];
        let plan = plan(&jobs, OperationKind::Restore, 2, &mounts, &events, &cancel).unwrap();

        assert_eq!(plan.total_files, 1);
        let task = &plan.batches[0][0];
        assert_eq!(task.source, backup.to_string_lossy());
        assert_eq!(task.dest, original.to_string_lossy());
        assert_eq!(task.size, 16);
    }

    #[test]
    fn missing_source_is_an_error_event_not_a_failure() {
        let (events, rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let jobs = vec![job(
            vec!["/no/such/path/anywhere".to_string()],
            vec!["/backup/out".to_string()],
        )];
        let plan = plan(&jobs, OperationKind::Backup, 2, &mounts, &events, &cancel).unwrap();

        assert_eq!(plan.total_files, 0);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, EngineEvent::FileError { .. })));
    }

    #[test]
    fn mismatched_pairs_skip_the_job() {
        let (events, rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let jobs = vec![CopyJob {
            id: "broken".to_string(),
            selected: true,
            sources: vec!["/a".to_string(), "/b".to_string()],
            destinations: vec!["/x".to_string()],
        }];
        let plan = plan(&jobs, OperationKind::Backup, 2, &mounts, &events, &cancel).unwrap();
        assert_eq!(plan.total_files, 0);
        assert!(rx.try_iter().any(
            |e| matches!(e, EngineEvent::FileError { source, .. } if source == "broken")
        ));
    }

    #[test]
    fn unselected_jobs_are_ignored() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();

        let (events, _rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = local_coordinator(events.clone(), cancel.clone());
        let mut unselected = job(
            vec![file.to_string_lossy().into_owned()],
            vec!["/backup/f.txt".to_string()],
        );
        unselected.selected = false;
        let plan = plan(
            &[unselected],
            OperationKind::Backup,
            2,
            &mounts,
            &events,
            &cancel,
        )
        .unwrap();
        assert_eq!(plan.total_files, 0);
    }

    #[test]
    fn jobs_deserialize_from_config_json() {
        let json = r#"[{
            "id": "docs",
            "sources": ["/home/user/docs"],
            "destinations": ["smb://nas/backup/docs"]
        }]"#;
        let jobs: Vec<CopyJob> = serde_json::from_str(json).unwrap();
        assert_eq!(jobs[0].id, "docs");
        assert!(jobs[0].selected, "selected defaults to true");
    }

    #[test]
    fn singleton_source_and_destination_parse_as_lists() {
        let json = r#"[{
            "id": "docs",
            "sources": "/home/u/docs",
            "destinations": "smb://nas/backup/docs"
        }]"#;
        let jobs: Vec<CopyJob> = serde_json::from_str(json).unwrap();
        assert_eq!(jobs[0].sources, vec!["/home/u/docs"]);
        assert_eq!(jobs[0].destinations, vec!["smb://nas/backup/docs"]);
    }

    #[test]
    fn share_destination_joins_with_slashes() {
        assert_eq!(
            join_destination("smb://nas/backup/docs", Path::new("sub/file.txt")),
            "smb://nas/backup/docs/sub/file.txt"
        );
        assert_eq!(
            join_destination("smb://nas/backup/", Path::new("f")),
            "smb://nas/backup/f"
        );
    }
}
