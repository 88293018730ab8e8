//! Per-profile background renewal process.
//!
//! The parent side (`RenewalDaemon`) owns the pid record under the state
//! directory and enforces one daemon per profile. The detached side
//! (`DaemonRuntime`) drives the scheduler until it is signalled or renewal
//! fails, then releases the record if it still names its own pid.

use std::{
    env, fs,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::{fd::AsRawFd, unix::process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    RenewalRequest,
    process::{ProcessController, ProcessStatus, Signal},
    scheduler::{RenewalScheduler, Renewer, RunOutcome},
};
use crate::{
    aws::{CredentialStore, Token},
    constants::{DAEMON_STOP_POLL_INTERVAL, DAEMON_STOP_TIMEOUT},
    error::{Error, Result},
};

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DaemonState {
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Stopped | DaemonState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    Killed { pid: u32 },
}

/// Spawns the detached renewal process and hands it its request
pub trait DaemonLauncher {
    /// Returns the pid of the launched process.
    fn launch(&self, profile: &str, request: &RenewalRequest) -> io::Result<u32>;
}

/// Re-executes the current binary as `renew --profile <profile>` in a new session
pub struct SelfExecLauncher {
    state_dir: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }
}

impl DaemonLauncher for SelfExecLauncher {
    fn launch(&self, profile: &str, request: &RenewalRequest) -> io::Result<u32> {
        let exe = env::current_exe()?;
        let payload = serde_json::to_vec(request).map_err(io::Error::other)?;

        // Anything the runtime prints before its subscriber is up lands in the log
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(&self.state_dir, profile))
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());

        let mut command = Command::new(exe);
        command
            .args(["--profile", profile, "renew"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(stderr);

        // Detach from the controlling terminal so closing it does not kill renewal
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let handed_over = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload),
            None => Err(io::Error::other("renewal process has no stdin")),
        };
        if let Err(e) = handed_over {
            let _ = child.kill();
            return Err(e);
        }

        debug!(profile, pid, "Launched renewal process");
        Ok(pid)
    }
}

pub fn record_path(state_dir: &Path, profile: &str) -> PathBuf {
    state_dir.join(format!("{profile}.pid"))
}

pub fn log_path(state_dir: &Path, profile: &str) -> PathBuf {
    state_dir.join(format!("{profile}.log"))
}

pub fn lock_path(state_dir: &Path, profile: &str) -> PathBuf {
    state_dir.join(format!("{profile}.lock"))
}

/// Exclusive `flock` on a profile's lock file, held until dropped.
///
/// Every change to a record other than the initial exclusive create happens
/// under this lock, so a liveness check and the removal it justifies cannot
/// interleave with another process doing the same.
struct RecordLock {
    _file: File,
}

impl RecordLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: flock is safe to call with a valid file descriptor
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { _file: file })
    }
}

/// Raw record contents, `None` when there is no record.
fn read_raw(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Empty or garbled records hold no pid.
fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse().ok().filter(|pid| *pid != 0)
}

/// Recorded pid, `None` when the record is missing; empty or garbled records read as `Some(None)`.
fn read_record(path: &Path) -> Result<Option<Option<u32>>> {
    Ok(read_raw(path)?.map(|contents| parse_pid(&contents)))
}

fn write_record(path: &Path, pid: u32, replace: bool) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    writeln!(temp, "{pid}")?;
    temp.as_file().sync_all()?;

    if replace {
        temp.persist(path).map_err(|e| e.error)?;
    } else {
        temp.persist_noclobber(path).map_err(|e| e.error)?;
    }
    Ok(())
}

fn remove_record(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove the record only if it still reads `expected`. Caller holds the lock.
fn remove_record_if(path: &Path, expected: &str) -> io::Result<bool> {
    match read_raw(path)? {
        Some(contents) if contents == expected => {
            remove_record(path)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Launches, finds and stops renewal daemons through their pid records
pub struct RenewalDaemon<C: ProcessController> {
    state_dir: PathBuf,
    controller: C,
    stop_timeout: Duration,
}

impl<C: ProcessController> RenewalDaemon<C> {
    pub fn new(state_dir: impl Into<PathBuf>, controller: C) -> Self {
        Self {
            state_dir: state_dir.into(),
            controller,
            stop_timeout: DAEMON_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn record_path(&self, profile: &str) -> PathBuf {
        record_path(&self.state_dir, profile)
    }

    fn lock(&self, profile: &str) -> io::Result<RecordLock> {
        fs::create_dir_all(&self.state_dir)?;
        RecordLock::acquire(&lock_path(&self.state_dir, profile))
    }

    fn is_live(&self, pid: u32) -> Result<bool> {
        match self.controller.check_process(pid)? {
            // Can't signal it, so it can't be ruled out either
            ProcessStatus::Running | ProcessStatus::NoPermission => Ok(true),
            ProcessStatus::NotFound => Ok(false),
        }
    }

    /// Pid of the live daemon for `profile`, if any.
    pub fn running_pid(&self, profile: &str) -> Result<Option<u32>> {
        let Some(Some(pid)) = read_record(&self.record_path(profile))? else {
            return Ok(None);
        };
        Ok(self.is_live(pid)?.then_some(pid))
    }

    /// Launch a daemon for `profile` unless a live one already exists.
    ///
    /// The record is claimed atomically (holding this process's pid) before
    /// launching, so a concurrent `start` sees a live owner and backs off.
    pub fn start<L>(&self, profile: &str, launcher: &L, request: &RenewalRequest) -> Result<u32>
    where
        L: DaemonLauncher + ?Sized,
    {
        let path = self.record_path(profile);

        self.claim(profile, &path)?;

        let pid = match launcher.launch(profile, request) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = remove_record(&path);
                return Err(e.into());
            }
        };
        write_record(&path, pid, true)?;

        info!(profile, pid, "Started renewal daemon");
        Ok(pid)
    }

    fn claim(&self, profile: &str, path: &Path) -> Result<()> {
        let _lock = self.lock(profile)?;
        let owner = std::process::id();

        for _ in 0..3 {
            match write_record(path, owner, false) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let Some(contents) = read_raw(path)? else {
                continue;
            };
            if let Some(pid) = parse_pid(&contents) {
                if self.is_live(pid)? {
                    return Err(Error::AlreadyRunning {
                        profile: profile.to_string(),
                        pid,
                    });
                }
            }
            if remove_record_if(path, &contents)? {
                info!(profile, path = %path.display(), "Reclaimed stale daemon record");
            } else {
                debug!(profile, "Daemon record changed while reclaiming it, re-checking");
            }
        }

        match self.running_pid(profile)? {
            Some(pid) => Err(Error::AlreadyRunning {
                profile: profile.to_string(),
                pid,
            }),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("could not claim {}", path.display()),
            ))),
        }
    }

    /// Drop `profile`'s record if it still holds `contents`.
    fn discard(&self, profile: &str, contents: &str) -> Result<()> {
        let _lock = self.lock(profile)?;
        remove_record_if(&self.record_path(profile), contents)?;
        Ok(())
    }

    /// Terminate the daemon for `profile`. No record means nothing to do.
    ///
    /// Blocks while waiting for the process to exit; async callers should
    /// run it on a blocking thread.
    pub fn stop(&self, profile: &str) -> Result<StopOutcome> {
        let path = self.record_path(profile);
        let Some(contents) = read_raw(&path)? else {
            return Ok(StopOutcome::NotRunning);
        };
        let Some(pid) = parse_pid(&contents) else {
            debug!(profile, "Removing unreadable daemon record");
            self.discard(profile, &contents)?;
            return Ok(StopOutcome::NotRunning);
        };

        let unreachable = |reason: String| Error::DaemonUnreachable { pid, reason };

        match self
            .controller
            .check_process(pid)
            .map_err(|e| unreachable(e.to_string()))?
        {
            ProcessStatus::NotFound => {
                info!(profile, pid, "Daemon already gone, removing stale record");
                self.discard(profile, &contents)?;
                return Ok(StopOutcome::NotRunning);
            }
            ProcessStatus::NoPermission => {
                return Err(unreachable("permission denied".to_string()));
            }
            ProcessStatus::Running => {}
        }

        self.controller
            .send_signal(pid, Signal::Term)
            .map_err(|e| unreachable(e.to_string()))?;
        if self.wait_for_exit(pid, &path, self.stop_timeout) {
            self.discard(profile, &contents)?;
            info!(profile, pid, "Stopped renewal daemon");
            return Ok(StopOutcome::Stopped { pid });
        }

        warn!(
            profile,
            pid,
            timeout_secs = self.stop_timeout.as_secs(),
            "Daemon ignored SIGTERM, sending SIGKILL"
        );
        self.controller
            .send_signal(pid, Signal::Kill)
            .map_err(|e| unreachable(e.to_string()))?;
        if self.wait_for_exit(pid, &path, KILL_GRACE) {
            self.discard(profile, &contents)?;
            return Ok(StopOutcome::Killed { pid });
        }

        Err(unreachable(
            "process still running after SIGKILL".to_string(),
        ))
    }

    /// Poll with backoff until the process is gone or has released its record.
    fn wait_for_exit(&self, pid: u32, path: &Path, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut delay = DAEMON_STOP_POLL_INTERVAL;

        loop {
            let gone = matches!(
                self.controller.check_process(pid),
                Ok(ProcessStatus::NotFound)
            );
            let released = !matches!(read_record(path), Ok(Some(Some(p))) if p == pid);
            if gone || released {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(delay);
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

/// Detached side of the daemon: state machine, stop signals and record cleanup
pub struct DaemonRuntime {
    profile: String,
    record: PathBuf,
    lock: PathBuf,
    pid: u32,
    state: DaemonState,
}

impl DaemonRuntime {
    pub fn new(state_dir: &Path, profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            record: record_path(state_dir, profile),
            lock: lock_path(state_dir, profile),
            pid: std::process::id(),
            state: DaemonState::NotStarted,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    fn enter(&mut self, next: DaemonState) {
        if self.state.can_transition_to(next) {
            debug!(profile = %self.profile, from = ?self.state, to = ?next, "Daemon state change");
            self.state = next;
        } else {
            warn!(profile = %self.profile, from = ?self.state, to = ?next, "Ignoring invalid daemon state change");
        }
    }

    /// Run until SIGTERM/SIGINT or a terminal renewal failure.
    pub async fn run<R, F>(
        self,
        scheduler: &RenewalScheduler,
        renewer: &R,
        store: &CredentialStore,
        expiration: DateTime<Utc>,
        on_renewed: F,
    ) -> Result<RunOutcome>
    where
        R: Renewer + ?Sized,
        F: FnMut(&Token),
    {
        let (tx, rx) = watch::channel(false);
        let listener = listen_for_stop(tx)?;
        let (_, outcome) = self
            .run_until(rx, scheduler, renewer, store, expiration, on_renewed)
            .await;
        listener.abort();
        Ok(outcome)
    }

    pub async fn run_until<R, F>(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        scheduler: &RenewalScheduler,
        renewer: &R,
        store: &CredentialStore,
        expiration: DateTime<Utc>,
        on_renewed: F,
    ) -> (DaemonState, RunOutcome)
    where
        R: Renewer + ?Sized,
        F: FnMut(&Token),
    {
        self.enter(DaemonState::Starting);
        self.enter(DaemonState::Running);
        info!(profile = %self.profile, pid = self.pid, "Renewal daemon running");

        let outcome = scheduler
            .run(
                renewer,
                store,
                &self.profile,
                expiration,
                &mut shutdown,
                on_renewed,
            )
            .await;

        match &outcome {
            RunOutcome::Stopped => {
                self.enter(DaemonState::Stopping);
                self.release();
                self.enter(DaemonState::Stopped);
                info!(profile = %self.profile, "Renewal daemon stopped");
            }
            RunOutcome::Failed(e) => {
                self.release();
                self.enter(DaemonState::Failed);
                warn!(profile = %self.profile, error = %e, "Renewal daemon failed");
            }
        }

        (self.state, outcome)
    }

    /// Remove the record only while it still names this process.
    fn release(&self) {
        let _lock = RecordLock::acquire(&self.lock)
            .inspect_err(|e| warn!(path = %self.lock.display(), error = %e, "Failed to lock daemon record"));

        match read_raw(&self.record) {
            Ok(Some(contents)) if parse_pid(&contents) == Some(self.pid) => {
                if let Err(e) = remove_record_if(&self.record, &contents) {
                    warn!(path = %self.record.display(), error = %e, "Failed to remove daemon record");
                }
            }
            Ok(_) => debug!(profile = %self.profile, "Daemon record no longer ours, leaving it"),
            Err(e) => warn!(error = %e, "Failed to read daemon record"),
        }
    }
}

fn listen_for_stop(tx: watch::Sender<bool>) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        tx.send_replace(true);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idp::{Factor, LoginCredentials};
    use crate::renewal::process::mock::MockProcessController;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn request() -> RenewalRequest {
        RenewalRequest {
            ecp_endpoint_url: "https://idp.example.com/idp/profile/SAML2/SOAP/ECP".to_string(),
            credentials: LoginCredentials {
                username: "user".to_string(),
                password: "secret".to_string(),
                factor: Some(Factor::Push),
                passcode: None,
            },
            role_arn: "arn:aws:iam::123456789012:role/Dev".to_string(),
            identity_provider: "arn:aws:iam::123456789012:saml-provider/idp".to_string(),
            duration_seconds: 3600,
            expiration: Utc::now(),
            margin: 0.9,
            interval_secs: None,
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        pid: u32,
        launched: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FakeLauncher {
        fn with_pid(pid: u32) -> Self {
            Self {
                pid,
                ..Default::default()
            }
        }
    }

    impl DaemonLauncher for FakeLauncher {
        fn launch(&self, profile: &str, _request: &RenewalRequest) -> io::Result<u32> {
            if self.fail {
                return Err(io::Error::other("spawn failed"));
            }
            self.launched.lock().unwrap().push(profile.to_string());
            Ok(self.pid)
        }
    }

    fn recorded_pid(daemon: &RenewalDaemon<MockProcessController>, profile: &str) -> Option<u32> {
        read_record(&daemon.record_path(profile)).unwrap().flatten()
    }

    #[test]
    fn test_state_transitions() {
        use DaemonState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Failed));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!NotStarted.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Starting));
        assert!(Stopped.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_start_writes_record() {
        let dir = TempDir::new().unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());
        let launcher = FakeLauncher::with_pid(4242);

        let pid = daemon.start("dev", &launcher, &request()).unwrap();

        assert_eq!(pid, 4242);
        assert_eq!(recorded_pid(&daemon, "dev"), Some(4242));
        assert!(dir.path().join("dev.pid").exists());
    }

    #[test]
    fn test_second_start_for_same_profile_is_rejected() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new().with_process(4242, ProcessStatus::Running);
        let daemon = RenewalDaemon::new(dir.path(), controller);
        let launcher = FakeLauncher::with_pid(4242);

        daemon.start("dev", &launcher, &request()).unwrap();
        let second = daemon.start("dev", &launcher, &request());

        assert!(matches!(
            second,
            Err(Error::AlreadyRunning { ref profile, pid: 4242 }) if profile == "dev"
        ));
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_profiles_are_independent() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new().with_process(4242, ProcessStatus::Running);
        let daemon = RenewalDaemon::new(dir.path(), controller);

        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();
        let pid = daemon
            .start("prod", &FakeLauncher::with_pid(5353), &request())
            .unwrap();

        assert_eq!(pid, 5353);
        assert_eq!(recorded_pid(&daemon, "dev"), Some(4242));
        assert_eq!(recorded_pid(&daemon, "prod"), Some(5353));
    }

    #[test]
    fn test_stale_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.pid"), "999999\n").unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());

        assert_eq!(daemon.running_pid("dev").unwrap(), None);
        let pid = daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(recorded_pid(&daemon, "dev"), Some(4242));
    }

    #[test]
    fn test_garbled_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.pid"), "").unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());

        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();
        assert_eq!(recorded_pid(&daemon, "dev"), Some(4242));
    }

    /// Reports the recorded owner dead, but only after a rival has claimed the record.
    struct RivalClaimController {
        record: PathBuf,
    }

    impl ProcessController for RivalClaimController {
        fn check_process(&self, pid: u32) -> io::Result<ProcessStatus> {
            match pid {
                999 => {
                    fs::write(&self.record, "5555\n")?;
                    Ok(ProcessStatus::NotFound)
                }
                5555 => Ok(ProcessStatus::Running),
                _ => Ok(ProcessStatus::NotFound),
            }
        }

        fn send_signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reclaim_keeps_rival_claim() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("dev.pid");
        fs::write(&record, "999\n").unwrap();
        let controller = RivalClaimController {
            record: record.clone(),
        };
        let daemon = RenewalDaemon::new(dir.path(), controller);
        let launcher = FakeLauncher::with_pid(4242);

        let result = daemon.start("dev", &launcher, &request());

        assert!(matches!(
            result,
            Err(Error::AlreadyRunning { ref profile, pid: 5555 }) if profile == "dev"
        ));
        assert_eq!(fs::read_to_string(&record).unwrap(), "5555\n");
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_waits_for_record_lock() {
        let dir = TempDir::new().unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());
        let launcher = FakeLauncher::with_pid(4242);
        let held = RecordLock::acquire(&lock_path(dir.path(), "dev")).unwrap();

        thread::scope(|scope| {
            let starting = scope.spawn(|| daemon.start("dev", &launcher, &request()));
            thread::sleep(Duration::from_millis(100));
            assert!(!daemon.record_path("dev").exists());

            drop(held);
            assert_eq!(starting.join().unwrap().unwrap(), 4242);
        });
        assert_eq!(recorded_pid(&daemon, "dev"), Some(4242));
    }

    #[test]
    fn test_start_after_stop_succeeds() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .exiting_on(Signal::Term);
        let daemon = RenewalDaemon::new(dir.path(), controller);

        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();
        assert!(matches!(
            daemon.start("dev", &FakeLauncher::with_pid(4343), &request()),
            Err(Error::AlreadyRunning { pid: 4242, .. })
        ));

        assert_eq!(
            daemon.stop("dev").unwrap(),
            StopOutcome::Stopped { pid: 4242 }
        );
        let pid = daemon
            .start("dev", &FakeLauncher::with_pid(5353), &request())
            .unwrap();

        assert_eq!(pid, 5353);
        assert_eq!(recorded_pid(&daemon, "dev"), Some(5353));
    }

    #[test]
    fn test_failed_launch_releases_claim() {
        let dir = TempDir::new().unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());
        let launcher = FakeLauncher {
            fail: true,
            ..Default::default()
        };

        assert!(daemon.start("dev", &launcher, &request()).is_err());
        assert!(!daemon.record_path("dev").exists());
    }

    #[test]
    fn test_stop_without_record_is_noop() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new();
        let daemon = RenewalDaemon::new(dir.path(), controller);

        assert_eq!(daemon.stop("dev").unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn test_stop_terminates_and_removes_record() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .exiting_on(Signal::Term);
        let daemon = RenewalDaemon::new(dir.path(), controller);
        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();

        assert_eq!(
            daemon.stop("dev").unwrap(),
            StopOutcome::Stopped { pid: 4242 }
        );
        assert!(!daemon.record_path("dev").exists());
        assert_eq!(daemon.controller.signals_sent(), vec![(4242, Signal::Term)]);
        assert_eq!(daemon.running_pid("dev").unwrap(), None);
    }

    #[test]
    fn test_stop_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .exiting_on(Signal::Kill);
        let daemon = RenewalDaemon::new(dir.path(), controller)
            .with_stop_timeout(Duration::from_millis(100));
        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();

        assert_eq!(daemon.stop("dev").unwrap(), StopOutcome::Killed { pid: 4242 });
        assert_eq!(
            daemon.controller.signals_sent(),
            vec![(4242, Signal::Term), (4242, Signal::Kill)]
        );
        assert!(!daemon.record_path("dev").exists());
    }

    #[test]
    fn test_stop_reports_unconfirmed_termination() {
        let dir = TempDir::new().unwrap();
        let controller = MockProcessController::new().with_process(4242, ProcessStatus::Running);
        let daemon = RenewalDaemon::new(dir.path(), controller)
            .with_stop_timeout(Duration::from_millis(50));
        daemon
            .start("dev", &FakeLauncher::with_pid(4242), &request())
            .unwrap();

        let result = daemon.stop("dev");
        assert!(matches!(
            result,
            Err(Error::DaemonUnreachable { pid: 4242, .. })
        ));
        assert!(daemon.record_path("dev").exists());
    }

    #[test]
    fn test_stop_with_dead_pid_cleans_up() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.pid"), "4242\n").unwrap();
        let daemon = RenewalDaemon::new(dir.path(), MockProcessController::new());

        assert_eq!(daemon.stop("dev").unwrap(), StopOutcome::NotRunning);
        assert!(!daemon.record_path("dev").exists());
        assert!(daemon.controller.signals_sent().is_empty());
    }

    #[test]
    fn test_stop_signal_failure_is_unreachable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dev.pid"), "4242\n").unwrap();
        let controller = MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .with_signal_error(io::Error::other("EPERM"));
        let daemon = RenewalDaemon::new(dir.path(), controller);

        assert!(matches!(
            daemon.stop("dev"),
            Err(Error::DaemonUnreachable { pid: 4242, .. })
        ));
    }

    struct FailingRenewer;

    #[async_trait]
    impl Renewer for FailingRenewer {
        async fn renew(&self) -> Result<Token> {
            Err(Error::AuthenticationFailed("password expired".into()))
        }
    }

    #[tokio::test]
    async fn test_runtime_releases_own_record_on_failure() {
        let dir = TempDir::new().unwrap();
        let record = record_path(dir.path(), "dev");
        write_record(&record, std::process::id(), false).unwrap();
        let store = CredentialStore::new(dir.path().join("credentials"));
        let scheduler = RenewalScheduler::new(0.9).unwrap();
        let (_tx, rx) = watch::channel(false);

        let runtime = DaemonRuntime::new(dir.path(), "dev");
        let (state, outcome) = runtime
            .run_until(rx, &scheduler, &FailingRenewer, &store, Utc::now(), |_| {})
            .await;

        assert_eq!(state, DaemonState::Failed);
        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert!(!record.exists());
    }

    #[tokio::test]
    async fn test_runtime_leaves_foreign_record_on_stop() {
        let dir = TempDir::new().unwrap();
        let record = record_path(dir.path(), "dev");
        write_record(&record, std::process::id() + 1, false).unwrap();
        let store = CredentialStore::new(dir.path().join("credentials"));
        let scheduler = RenewalScheduler::new(0.9).unwrap();
        let (tx, rx) = watch::channel(true);

        let runtime = DaemonRuntime::new(dir.path(), "dev");
        let (state, outcome) = runtime
            .run_until(
                rx,
                &scheduler,
                &FailingRenewer,
                &store,
                Utc::now() + chrono::TimeDelta::hours(1),
                |_| {},
            )
            .await;
        drop(tx);

        assert_eq!(state, DaemonState::Stopped);
        assert!(matches!(outcome, RunOutcome::Stopped));
        assert!(record.exists());
    }
}
