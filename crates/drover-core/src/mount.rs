//! OS-level mounting of network shares.
//!
//! The coordinator owns a process-private mount root and a registry keyed by
//! (server, share). At most one live mount exists per key; concurrent
//! requesters for a key block on a condition variable until the first
//! mounter finishes, then reuse its mount point. The actual mount/unmount
//! subprocess work sits behind the `Mounter` trait so the registry logic is
//! testable without a network share.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use crate::cancel::CancelFlag;
use crate::credentials::{CredentialSource, ShareCredentials};
use crate::errors::{CopyError, CopyResult};
use crate::events::{EngineEvent, EventSink};
use crate::share_path::SharePath;

/// How long a requester waits for another thread's in-flight mount.
const MOUNT_WAIT_TICK: Duration = Duration::from_millis(500);
const MOUNT_WAIT_TRIES: u32 = 10;

/// Identity of one mounted share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountKey {
    pub server: String,
    pub share: String,
}

impl MountKey {
    pub fn of(share: &SharePath) -> Self {
        Self {
            server: share.server.clone(),
            share: share.share.clone(),
        }
    }
}

impl std::fmt::Display for MountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "//{}/{}", self.server, self.share)
    }
}

/// Backend performing the actual OS mount/unmount.
pub trait Mounter: Send + Sync {
    fn mount(
        &self,
        key: &MountKey,
        credentials_file: &Path,
        target: &Path,
        sudo_password: Option<&str>,
        cancel: &CancelFlag,
    ) -> CopyResult<()>;

    fn unmount(&self, target: &Path, sudo_password: Option<&str>, lazy: bool) -> CopyResult<()>;

    fn is_mounted(&self, target: &Path) -> bool;
}

/// Production backend: drives the system `mount`/`umount` utilities for CIFS
/// shares, non-interactively first and with a supplied sudo password on
/// retry. Every subprocess runs under a hard deadline so an unreachable
/// server cannot block a worker indefinitely.
pub struct CifsMounter {
    mount_timeout: Duration,
    interactive_ceiling: Duration,
    unmount_timeout: Duration,
}

impl CifsMounter {
    pub fn new() -> Self {
        Self {
            mount_timeout: Duration::from_secs(10),
            interactive_ceiling: Duration::from_secs(30),
            unmount_timeout: Duration::from_secs(5),
        }
    }

    fn mount_options(credentials_file: &Path) -> String {
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            format!(
                "credentials={},uid={uid},gid={gid}",
                credentials_file.display()
            )
        }
        #[cfg(not(unix))]
        {
            format!("credentials={}", credentials_file.display())
        }
    }
}

impl Default for CifsMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Mounter for CifsMounter {
    fn mount(
        &self,
        key: &MountKey,
        credentials_file: &Path,
        target: &Path,
        sudo_password: Option<&str>,
        cancel: &CancelFlag,
    ) -> CopyResult<()> {
        let source = key.to_string();
        let options = Self::mount_options(credentials_file);

        let mut cmd = Command::new("sudo");
        match sudo_password {
            None => cmd.arg("-n"),
            Some(_) => cmd.args(["-S", "-p", ""]),
        };
        cmd.args(["mount", "-t", "cifs", &source])
            .arg(target)
            .args(["-o", &options]);

        let timeout = if sudo_password.is_some() {
            self.interactive_ceiling
        } else {
            self.mount_timeout
        };

        match run_with_deadline(cmd, sudo_password, timeout, Some(cancel)) {
            Ok(()) => Ok(()),
            Err(CopyError::Io(err)) if err.kind() == io::ErrorKind::TimedOut => {
                Err(CopyError::MountTimeout {
                    server: key.server.clone(),
                    share: key.share.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }

    // Plain `umount` when no password is given; escalation is the
    // coordinator's retry tier, not the default.
    fn unmount(&self, target: &Path, sudo_password: Option<&str>, lazy: bool) -> CopyResult<()> {
        let mut cmd = match sudo_password {
            None => Command::new("umount"),
            Some(_) => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-S", "-p", "", "umount"]);
                cmd
            }
        };
        if lazy {
            cmd.arg("-l");
        }
        cmd.arg(target);
        run_with_deadline(cmd, sudo_password, self.unmount_timeout, None)
    }

    fn is_mounted(&self, target: &Path) -> bool {
        #[cfg(target_os = "linux")]
        {
            let Ok(mounts) = fs::read_to_string("/proc/self/mounts") else {
                return true;
            };
            let needle = target.to_string_lossy();
            mounts
                .lines()
                .filter_map(|line| line.split_whitespace().nth(1))
                .any(|point| point == needle)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = target;
            true
        }
    }
}

/// Run a command to completion under a deadline, feeding `stdin_line` (plus
/// newline) when given. Kills the child on expiry or cancellation.
fn run_with_deadline(
    mut cmd: Command,
    stdin_line: Option<&str>,
    deadline: Duration,
    cancel: Option<&CancelFlag>,
) -> CopyResult<()> {
    use std::io::Write;

    cmd.stdin(if stdin_line.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::null())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    if let Some(line) = stdin_line {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(line.as_bytes());
            let _ = stdin.write_all(b"\n");
        }
    }

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                use std::io::Read;
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            let message = if detail.is_empty() {
                format!("command exited with {status}")
            } else {
                detail.to_string()
            };
            return Err(CopyError::Io(io::Error::other(message)));
        }
        if cancel.is_some_and(|flag| flag.is_cancelled()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CopyError::Cancelled);
        }
        if started.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CopyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "subprocess deadline exceeded",
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Transient on-disk credentials, removed on drop regardless of how the
/// mount attempt ends.
struct CredentialsFile {
    path: PathBuf,
}

impl CredentialsFile {
    fn write(dir: &Path, key: &MountKey, creds: &ShareCredentials) -> CopyResult<Self> {
        use std::io::Write;

        let path = dir.join(format!(
            ".credentials-{}-{}",
            sanitize(&key.server),
            sanitize(&key.share)
        ));
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        writeln!(file, "username={}", creds.username)?;
        writeln!(file, "password={}", creds.password)?;
        writeln!(file, "domain={}", creds.domain)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CredentialsFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!(
                "could not remove credentials file {}: {err}",
                self.path.display()
            );
        }
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[derive(Default)]
struct Registry {
    mounted: HashMap<MountKey, PathBuf>,
    in_progress: HashSet<MountKey>,
}

/// Serializes and caches share mounts for the whole operation.
pub struct MountCoordinator {
    mounter: Box<dyn Mounter>,
    registry: Mutex<Registry>,
    mount_ready: Condvar,
    root: TempDir,
    credentials: CredentialSource,
    events: EventSink,
    cancel: CancelFlag,
    sudo_password: Mutex<Option<String>>,
}

impl MountCoordinator {
    pub fn new(
        mounter: Box<dyn Mounter>,
        credentials: CredentialSource,
        events: EventSink,
        cancel: CancelFlag,
    ) -> CopyResult<Self> {
        let root = tempfile::Builder::new().prefix("drover-mounts-").tempdir()?;
        Ok(Self {
            mounter,
            registry: Mutex::new(Registry::default()),
            mount_ready: Condvar::new(),
            root,
            credentials,
            events,
            cancel,
            sudo_password: Mutex::new(None),
        })
    }

    /// Resolve a share path to a plain local path, mounting on first use.
    pub fn resolve(&self, share: &SharePath) -> CopyResult<PathBuf> {
        let point = self.mount(&MountKey::of(share))?;
        if share.rel.as_os_str().is_empty() {
            Ok(point)
        } else {
            Ok(point.join(&share.rel))
        }
    }

    /// Return the mount point for `key`, mounting if no live mount exists.
    /// Blocks (bounded) while another thread mounts the same key.
    pub fn mount(&self, key: &MountKey) -> CopyResult<PathBuf> {
        let mut registry = self.registry.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            if let Some(point) = registry.mounted.get(key).cloned() {
                if self.mounter.is_mounted(&point) {
                    return Ok(point);
                }
                // Stale entry, e.g. unmounted behind our back. Remount.
                log::warn!("mount point {} for {key} went away, remounting", point.display());
                registry.mounted.remove(key);
            }
            if !registry.in_progress.contains(key) {
                registry.in_progress.insert(key.clone());
                break;
            }
            let mut tries = 0;
            while registry.in_progress.contains(key) {
                if tries >= MOUNT_WAIT_TRIES {
                    return Err(CopyError::MountTimeout {
                        server: key.server.clone(),
                        share: key.share.clone(),
                    });
                }
                let _ = self.mount_ready.wait_for(&mut registry, MOUNT_WAIT_TICK);
                if self.cancel.is_cancelled() {
                    return Err(CopyError::Cancelled);
                }
                tries += 1;
            }
            // The other mount finished; re-check the registry.
        }
        drop(registry);

        let outcome = self.mount_fresh(key);

        let mut registry = self.registry.lock();
        registry.in_progress.remove(key);
        if let Ok(point) = &outcome {
            registry.mounted.insert(key.clone(), point.clone());
        }
        self.mount_ready.notify_all();
        outcome
    }

    fn mount_fresh(&self, key: &MountKey) -> CopyResult<PathBuf> {
        if self.cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let creds = self
            .credentials
            .share_credentials(&key.server, &key.share, &self.cancel)?;

        let target = self.root.path().join(format!(
            "{}-{}",
            sanitize(&key.server),
            sanitize(&key.share)
        ));
        fs::create_dir_all(&target)?;
        let credentials_file = CredentialsFile::write(self.root.path(), key, &creds)?;

        log::info!("mounting {key} at {}", target.display());
        let first = self.mounter.mount(
            key,
            credentials_file.path(),
            &target,
            None,
            &self.cancel,
        );
        let outcome = match first {
            Ok(()) => Ok(()),
            Err(CopyError::Cancelled) => Err(CopyError::Cancelled),
            Err(err) => {
                log::debug!("non-interactive mount of {key} failed: {err}");
                let password = self.sudo_password()?;
                self.mounter.mount(
                    key,
                    credentials_file.path(),
                    &target,
                    Some(&password),
                    &self.cancel,
                )
            }
        };

        if outcome.is_err() {
            let _ = fs::remove_dir(&target);
        }
        outcome.map(|()| target)
    }

    /// Elevated password, requested from the caller at most once per run.
    fn sudo_password(&self) -> CopyResult<String> {
        let mut cached = self.sudo_password.lock();
        if let Some(password) = cached.as_ref() {
            return Ok(password.clone());
        }
        self.events.emit(EngineEvent::SudoPasswordRequested);
        let password = self.credentials.sudo_password(&self.cancel)?;
        *cached = Some(password.clone());
        Ok(password)
    }

    /// Unmount one point: plain, then with the sudo password, then lazily,
    /// stopping at the first success. Removes the directory if empty.
    fn unmount_point(&self, point: &Path) -> CopyResult<()> {
        let mut result = self.mounter.unmount(point, None, false);
        if result.is_err() {
            if let Some(password) = self.sudo_password.lock().clone() {
                result = self.mounter.unmount(point, Some(&password), false);
            }
        }
        if result.is_err() {
            let password = self.sudo_password.lock().clone();
            result = self.mounter.unmount(point, password.as_deref(), true);
        }
        result?;
        if fs::read_dir(point).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(point);
        }
        Ok(())
    }

    /// Tear down every tracked mount at the end of a successful run.
    pub fn unmount_all(&self) {
        let points: Vec<(MountKey, PathBuf)> =
            self.registry.lock().mounted.drain().collect();
        for (key, point) in points {
            if let Err(err) = self.unmount_point(&point) {
                log::warn!("could not unmount {key} at {}: {err}", point.display());
            }
        }
    }

    /// Best-effort teardown on cancellation or share failure: lazy-unmount
    /// everything and release all waiters.
    pub fn force_cleanup(&self) {
        let points: Vec<PathBuf> = {
            let mut registry = self.registry.lock();
            registry.in_progress.clear();
            registry.mounted.drain().map(|(_, p)| p).collect()
        };
        self.mount_ready.notify_all();
        for point in points {
            if let Err(err) = self.mounter.unmount(&point, None, true) {
                log::warn!("lazy unmount of {} failed: {err}", point.display());
            }
            let _ = fs::remove_dir(&point);
        }
    }

    /// Number of live mounts; used by tests and the final summary log.
    pub fn mounted_count(&self) -> usize {
        self.registry.lock().mounted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend that "mounts" by touching nothing and counts invocations.
    struct FakeMounter {
        mounts: AtomicUsize,
        fail_noninteractive: bool,
        fail_plain_unmount: bool,
        /// (escalated, lazy) per unmount call, in order.
        unmount_calls: Arc<Mutex<Vec<(bool, bool)>>>,
    }

    impl FakeMounter {
        fn new(fail_noninteractive: bool) -> Self {
            Self {
                mounts: AtomicUsize::new(0),
                fail_noninteractive,
                fail_plain_unmount: false,
                unmount_calls: Arc::default(),
            }
        }
    }

    impl Mounter for FakeMounter {
        fn mount(
            &self,
            _key: &MountKey,
            credentials_file: &Path,
            _target: &Path,
            sudo_password: Option<&str>,
            _cancel: &CancelFlag,
        ) -> CopyResult<()> {
            assert!(credentials_file.exists(), "credentials file must exist during mount");
            if self.fail_noninteractive && sudo_password.is_none() {
                return Err(CopyError::Io(io::Error::other("permission denied")));
            }
            self.mounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unmount(&self, _target: &Path, sudo_password: Option<&str>, lazy: bool) -> CopyResult<()> {
            self.unmount_calls
                .lock()
                .push((sudo_password.is_some(), lazy));
            if self.fail_plain_unmount && sudo_password.is_none() && !lazy {
                return Err(CopyError::Io(io::Error::other("umount: permission denied")));
            }
            Ok(())
        }

        fn is_mounted(&self, _target: &Path) -> bool {
            true
        }
    }

    fn serve_credentials(requests: crossbeam_channel::Receiver<CredentialRequest>) {
        std::thread::spawn(move || {
            for request in requests {
                match request {
                    CredentialRequest::Share { reply, .. } => {
                        let _ = reply.send(Some(ShareCredentials {
                            username: "user".into(),
                            password: "pw".into(),
                            domain: String::new(),
                        }));
                    }
                    CredentialRequest::SudoPassword { reply } => {
                        let _ = reply.send(Some("rootpw".into()));
                    }
                }
            }
        });
    }

    fn coordinator(mounter: FakeMounter) -> (Arc<MountCoordinator>, CancelFlag) {
        let (credentials, requests) = CredentialSource::channel();
        serve_credentials(requests);
        let (events, _rx) = EventSink::channel();
        let cancel = CancelFlag::new();
        let coordinator = MountCoordinator::new(
            Box::new(mounter),
            credentials,
            events,
            cancel.clone(),
        )
        .unwrap();
        (Arc::new(coordinator), cancel)
    }

    #[test]
    fn second_mount_of_same_key_reuses_the_first() {
        let (coordinator, _cancel) = coordinator(FakeMounter::new(false));
        let key = MountKey {
            server: "nas".into(),
            share: "media".into(),
        };
        let first = coordinator.mount(&key).unwrap();
        let second = coordinator.mount(&key).unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.mounted_count(), 1);
    }

    #[test]
    fn interactive_retry_after_noninteractive_failure() {
        let (coordinator, _cancel) = coordinator(FakeMounter::new(true));
        let key = MountKey {
            server: "nas".into(),
            share: "backup".into(),
        };
        coordinator.mount(&key).unwrap();
        assert_eq!(coordinator.mounted_count(), 1);
    }

    #[test]
    fn unmount_escalates_only_after_plain_attempt_fails() {
        let mut mounter = FakeMounter::new(true);
        mounter.fail_plain_unmount = true;
        let calls = Arc::clone(&mounter.unmount_calls);
        let (coordinator, _cancel) = coordinator(mounter);
        let key = MountKey {
            server: "nas".into(),
            share: "backup".into(),
        };
        coordinator.mount(&key).unwrap();
        coordinator.unmount_all();
        // First a plain unmount, then the escalated retry; lazy never needed.
        assert_eq!(*calls.lock(), vec![(false, false), (true, false)]);
    }

    #[test]
    fn cancelled_coordinator_refuses_new_mounts() {
        let (coordinator, cancel) = coordinator(FakeMounter::new(false));
        cancel.cancel();
        let key = MountKey {
            server: "nas".into(),
            share: "media".into(),
        };
        assert!(matches!(coordinator.mount(&key), Err(CopyError::Cancelled)));
    }

    #[test]
    fn force_cleanup_clears_registry() {
        let (coordinator, _cancel) = coordinator(FakeMounter::new(false));
        let key = MountKey {
            server: "nas".into(),
            share: "media".into(),
        };
        coordinator.mount(&key).unwrap();
        coordinator.force_cleanup();
        assert_eq!(coordinator.mounted_count(), 0);
    }

    #[test]
    fn credentials_file_removed_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let key = MountKey {
            server: "nas".into(),
            share: "media".into(),
        };
        let creds = ShareCredentials {
            username: "u".into(),
            password: "p".into(),
            domain: "d".into(),
        };
        let path = {
            let file = CredentialsFile::write(dir.path(), &key, &creds).unwrap();
            let content = fs::read_to_string(file.path()).unwrap();
            assert!(content.contains("username=u"));
            assert!(content.contains("password=p"));
            assert!(content.contains("domain=d"));
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = fs::metadata(file.path()).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o600);
            }
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
