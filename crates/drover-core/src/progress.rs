//! Progress accounting and event emission.
//!
//! Every file task terminates in exactly one of copied / skipped / error,
//! and each terminal state updates the counters and emits its event under
//! one lock, so the final totals are deterministic regardless of worker
//! interleaving.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::events::{EngineEvent, EventSink};
use crate::planner::FileTask;

#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub total_files: usize,
    pub processed_files: usize,
    pub copied: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ProgressState {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.processed_bytes * 100) / self.total_bytes).min(100) as u8
    }
}

struct Inner {
    state: ProgressState,
    seen_errors: HashSet<(String, String)>,
}

pub struct ProgressTracker {
    inner: Mutex<Inner>,
    events: EventSink,
}

impl ProgressTracker {
    pub fn new(total_files: usize, total_bytes: u64, events: EventSink) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ProgressState {
                    total_files,
                    total_bytes,
                    ..Default::default()
                },
                seen_errors: HashSet::new(),
            }),
            events,
        }
    }

    pub fn file_copied(&self, task: &FileTask) {
        let mut inner = self.inner.lock();
        inner.state.processed_files += 1;
        inner.state.processed_bytes += task.size;
        inner.state.copied += 1;
        let status = status_line(&inner.state);
        let percent = inner.state.percent();
        drop(inner);
        self.events.emit(EngineEvent::FileCopied {
            source: task.source.clone(),
            dest: task.dest.clone(),
            bytes: task.size,
        });
        self.events.emit(EngineEvent::ProgressUpdated { percent, status });
    }

    pub fn file_skipped(&self, task: &FileTask, reason: &str) {
        let mut inner = self.inner.lock();
        inner.state.processed_files += 1;
        inner.state.processed_bytes += task.size;
        inner.state.skipped += 1;
        let status = status_line(&inner.state);
        let percent = inner.state.percent();
        drop(inner);
        self.events.emit(EngineEvent::FileSkipped {
            source: task.source.clone(),
            reason: reason.to_string(),
        });
        self.events.emit(EngineEvent::ProgressUpdated { percent, status });
    }

    /// Counts every failure, but emits the FileError event only once per
    /// (source, message) so a dead share does not flood the caller.
    pub fn file_error(&self, task: &FileTask, message: &str) {
        let mut inner = self.inner.lock();
        inner.state.processed_files += 1;
        inner.state.processed_bytes += task.size;
        inner.state.errors += 1;
        let fresh = inner
            .seen_errors
            .insert((task.source.clone(), message.to_string()));
        let status = status_line(&inner.state);
        let percent = inner.state.percent();
        drop(inner);
        if fresh {
            self.events.emit(EngineEvent::FileError {
                source: task.source.clone(),
                message: message.to_string(),
            });
        }
        self.events.emit(EngineEvent::ProgressUpdated { percent, status });
    }

    pub fn snapshot(&self) -> ProgressState {
        self.inner.lock().state.clone()
    }
}

fn status_line(state: &ProgressState) -> String {
    format!(
        "{} of {} files ({} of {})",
        state.processed_files,
        state.total_files,
        human_bytes(state.processed_bytes),
        human_bytes(state.total_bytes),
    )
}

/// Render a byte count the way the status line wants it.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
