//! The copy engine: planning, the worker pool, and teardown.
//!
//! One dispatcher (the caller of `run`) plus a bounded pool of OS threads.
//! Workers claim whole batches through a mutex-guarded cursor, never holding
//! the lock across I/O, and report every task to the progress tracker
//! exactly once. The run always terminates with `OperationCompleted`, even
//! if the dispatcher panics.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::buffer::BufferPolicy;
use crate::cancel::CancelFlag;
use crate::copy::{fast_copy, is_up_to_date};
use crate::credentials::CredentialSource;
use crate::errors::{CopyError, CopyResult};
use crate::events::{EngineEvent, EventSink};
use crate::mount::{CifsMounter, MountCoordinator, Mounter};
use crate::planner::{self, CopyJob, FileTask, OperationKind};
use crate::progress::ProgressTracker;
use crate::share_path::{is_share_path, SharePath};
use crate::EngineConfig;

/// How long the dispatcher waits for workers to exit on their own before
/// detaching them.
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(30);

/// Final totals for one run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub total_files: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub copied: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Fail-fast trigger for share-level failures: the first one cancels the
/// whole operation, because every remaining file on that share would fail
/// identically and flood the caller with duplicates.
struct ShareFailFast {
    fired: AtomicBool,
    events: EventSink,
    cancel: CancelFlag,
}

impl ShareFailFast {
    fn new(events: EventSink, cancel: CancelFlag) -> Self {
        Self {
            fired: AtomicBool::new(false),
            events,
            cancel,
        }
    }

    fn trigger(&self, mounts: &MountCoordinator) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            log::warn!("network share failure, cancelling the operation");
            self.events.emit(EngineEvent::SmbErrorCancel);
            self.cancel.cancel();
            mounts.force_cleanup();
        }
    }
}

pub struct CopyEngine {
    config: EngineConfig,
    events: EventSink,
    cancel: CancelFlag,
    mounts: Arc<MountCoordinator>,
}

impl CopyEngine {
    /// Build an engine with the production CIFS mounter. Returns the event
    /// receiver the caller drains for progress.
    pub fn new(
        config: EngineConfig,
        credentials: CredentialSource,
    ) -> CopyResult<(Self, Receiver<EngineEvent>)> {
        Self::with_mounter(config, credentials, Box::new(CifsMounter::new()))
    }

    /// Same, with an explicit mount backend. This is the seam tests use to
    /// exercise share handling without a reachable file server.
    pub fn with_mounter(
        config: EngineConfig,
        credentials: CredentialSource,
        mounter: Box<dyn Mounter>,
    ) -> CopyResult<(Self, Receiver<EngineEvent>)> {
        let (events, receiver) = EventSink::channel();
        let cancel = CancelFlag::new();
        let mounts = Arc::new(MountCoordinator::new(
            mounter,
            credentials,
            events.clone(),
            cancel.clone(),
        )?);
        Ok((
            Self {
                config,
                events,
                cancel,
                mounts,
            },
            receiver,
        ))
    }

    /// Handle the caller uses to cancel a run in flight.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Execute `jobs` to completion (or cancellation). Blocking; callers
    /// that need a live UI run this on its own thread and drain the event
    /// receiver elsewhere.
    pub fn run(&self, jobs: &[CopyJob], kind: OperationKind) -> Summary {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_inner(jobs, kind)));

        if self.cancel.is_cancelled() {
            self.mounts.force_cleanup();
        } else {
            self.mounts.unmount_all();
        }

        // The terminal event fires no matter what happened above, so the
        // caller's UI is never left hanging.
        self.events.emit(EngineEvent::OperationCompleted);

        let mut summary = match outcome {
            Ok(summary) => summary,
            Err(_) => {
                log::error!("copy dispatcher panicked; reporting an empty run");
                Summary::default()
            }
        };
        summary.cancelled = self.cancel.is_cancelled();
        summary.duration = started.elapsed();
        summary
    }

    fn run_inner(&self, jobs: &[CopyJob], kind: OperationKind) -> Summary {
        let fail_fast = Arc::new(ShareFailFast::new(self.events.clone(), self.cancel.clone()));

        let plan = match planner::plan(
            jobs,
            kind,
            self.config.workers,
            &self.mounts,
            &self.events,
            &self.cancel,
        ) {
            Ok(plan) => plan,
            Err(CopyError::Cancelled) => return Summary::default(),
            Err(err) => {
                log::warn!("planning aborted: {err}");
                fail_fast.trigger(&self.mounts);
                return Summary {
                    errors: 1,
                    ..Default::default()
                };
            }
        };

        log::info!(
            "planned {} files, {} bytes in {} batches",
            plan.total_files,
            plan.total_bytes,
            plan.batches.len()
        );

        let tracker = Arc::new(ProgressTracker::new(
            plan.total_files,
            plan.total_bytes,
            self.events.clone(),
        ));
        let batches = Arc::new(plan.batches);
        let cursor = Arc::new(Mutex::new(0usize));
        let policy = Arc::new(BufferPolicy::new());

        let workers = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let ctx = WorkerContext {
                batches: Arc::clone(&batches),
                cursor: Arc::clone(&cursor),
                tracker: Arc::clone(&tracker),
                mounts: Arc::clone(&self.mounts),
                policy: Arc::clone(&policy),
                cancel: self.cancel.clone(),
                fail_fast: Arc::clone(&fail_fast),
                preserve_times: self.config.preserve_times,
            };
            let handle = thread::Builder::new()
                .name(format!("copy-worker-{index}"))
                .spawn(move || worker_loop(ctx))
                .expect("spawn copy worker");
            handles.push(handle);
        }

        join_with_grace(handles, WORKER_JOIN_GRACE);

        let state = tracker.snapshot();
        Summary {
            total_files: state.total_files,
            total_bytes: state.total_bytes,
            processed_bytes: state.processed_bytes,
            copied: state.copied,
            skipped: state.skipped,
            errors: state.errors,
            cancelled: self.cancel.is_cancelled(),
            duration: Duration::default(),
        }
    }
}

struct WorkerContext {
    batches: Arc<Vec<Vec<FileTask>>>,
    cursor: Arc<Mutex<usize>>,
    tracker: Arc<ProgressTracker>,
    mounts: Arc<MountCoordinator>,
    policy: Arc<BufferPolicy>,
    cancel: CancelFlag,
    fail_fast: Arc<ShareFailFast>,
    preserve_times: bool,
}

fn worker_loop(ctx: WorkerContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        // The cursor lock covers only the increment, never any I/O.
        let index = {
            let mut next = ctx.cursor.lock();
            if *next >= ctx.batches.len() {
                return;
            }
            let claimed = *next;
            *next += 1;
            claimed
        };
        for task in &ctx.batches[index] {
            if ctx.cancel.is_cancelled() {
                return;
            }
            process_task(&ctx, task);
        }
    }
}

fn process_task(ctx: &WorkerContext, task: &FileTask) {
    let source_is_share = is_share_path(&task.source);
    let dest_is_share = is_share_path(&task.dest);

    let source = match resolve_endpoint(&task.source, &ctx.mounts) {
        Ok(path) => path,
        Err(CopyError::Cancelled) => return,
        Err(err) => {
            ctx.tracker.file_error(task, &err.to_string());
            ctx.fail_fast.trigger(&ctx.mounts);
            return;
        }
    };
    let dest = match resolve_endpoint(&task.dest, &ctx.mounts) {
        Ok(path) => path,
        Err(CopyError::Cancelled) => return,
        Err(err) => {
            ctx.tracker.file_error(task, &err.to_string());
            ctx.fail_fast.trigger(&ctx.mounts);
            return;
        }
    };

    // Idempotence applies to plain local pairs; share copies always move
    // bytes once the share is reachable.
    if !source_is_share && !dest_is_share && is_up_to_date(&source, &dest) {
        ctx.tracker.file_skipped(task, "up to date");
        return;
    }

    match fast_copy(
        &source,
        &dest,
        task.size,
        &ctx.policy,
        &ctx.cancel,
        ctx.preserve_times,
    ) {
        Ok(_) => ctx.tracker.file_copied(task),
        Err(CopyError::Cancelled) => (),
        Err(err) => {
            let message = err.to_string();
            if planner::message_matches_skip_pattern(&message) {
                ctx.tracker.file_skipped(task, &message);
            } else {
                ctx.tracker.file_error(task, &message);
                if err.is_share_fatal() {
                    ctx.fail_fast.trigger(&ctx.mounts);
                }
            }
        }
    }
}

/// Share paths go through the mount coordinator; local paths pass straight
/// through. Resolve failures on a share path are share-fatal upstream.
fn resolve_endpoint(raw: &str, mounts: &MountCoordinator) -> CopyResult<PathBuf> {
    if is_share_path(raw) {
        let parsed = SharePath::parse(raw)?;
        mounts.resolve(&parsed)
    } else {
        Ok(PathBuf::from(raw))
    }
}

/// Wait (bounded) for workers to drain; a worker stuck past the grace
/// period is detached so the run can still reach its terminal event.
fn join_with_grace(handles: Vec<thread::JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for handle in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("copy worker panicked");
            }
        } else {
            log::warn!("copy worker did not exit within {grace:?}, detaching");
        }
    }
}
