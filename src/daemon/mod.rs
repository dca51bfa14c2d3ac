//! Single instance lifecycle of an agent process.
//!
//! The lock file under `{daemon_directory}/{agent_name}` decides which process
//! is the agent. It is created exclusively, always names a live process while
//! a start is in progress, and is only removed once its process is gone.

mod files;
mod process;

pub use files::{
    DaemonFiles,
    LockState,
    ProcessIdentity,
};
pub use process::{
    is_alive,
    Detach,
    Detached,
    DoubleFork,
    Foreground,
};

use signal_hook::consts::{
    SIGKILL,
    SIGTERM,
};
use std::{
    fmt,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use strum::Display;

/// How long a process gets to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("agent is already running with PID {pid}")]
    AlreadyRunning { pid: i32 },
    #[error("stale lock left by {}, use force to start anyway", .pid.map(|pid| format!("PID {pid}")).unwrap_or_else(|| "an unknown process".to_string()))]
    StaleLock { pid: Option<i32> },
    #[error("PID {pid} did not exit after SIGKILL")]
    Unkillable { pid: i32 },
    #[error("failed to signal PID {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to detach from the terminal: {0}")]
    Detach(#[source] std::io::Error),
    #[error("daemon directory {} is unusable: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| LockError::Io { path, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of [`DaemonSupervisor::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: i32 },
    Stopped { stale_pid: Option<i32> },
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonStatus::Running { pid } => write!(f, "{} (PID {pid})", DaemonState::Running),
            DaemonStatus::Stopped { stale_pid: Some(pid) } => {
                write!(f, "{} (stale PID {pid} recorded)", DaemonState::Stopped)
            }
            DaemonStatus::Stopped { stale_pid: None } => write!(f, "{}", DaemonState::Stopped),
        }
    }
}

pub enum StartOutcome {
    /// This process is the agent. Keep the guard alive while running.
    Running(RunningDaemon),
    /// The agent was started in a detached process.
    Detached { pid: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: i32, forced: bool },
    /// Nothing was running. Leftover files of a dead process were removed.
    NotRunning { stale_pid: Option<i32> },
}

/// Owns the lock of the running agent and releases it on drop.
#[derive(Debug)]
pub struct RunningDaemon {
    files: DaemonFiles,
    pid: i32,
    released: bool,
}

impl RunningDaemon {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_files()
    }

    fn release_files(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // never remove a lock another process took over
        match self.files.lock_state().map_err(LockError::io(self.files.dir()))? {
            LockState::Held(holder) if holder.pid != self.pid => {
                warn!(holder = holder.pid, "lock taken over by another process, leaving it in place");
                Ok(())
            }
            _ => {
                self.files.remove().map_err(LockError::io(self.files.dir()))?;
                debug!(pid = self.pid, "released daemon lock");
                Ok(())
            }
        }
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        if let Err(err) = self.release_files() {
            error!(%err, "failed to release daemon lock");
        }
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

pub struct DaemonSupervisor {
    files: DaemonFiles,
    stop_timeout: Duration,
    state: DaemonState,
}

impl DaemonSupervisor {
    pub fn new(daemon_dir: impl Into<PathBuf>, stop_timeout: Duration) -> Self {
        Self {
            files: DaemonFiles::new(daemon_dir),
            stop_timeout,
            state: DaemonState::Stopped,
        }
    }

    pub fn files(&self) -> &DaemonFiles {
        &self.files
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Takes the lock and detaches.
    ///
    /// A lock held by a live process fails with [`LockError::AlreadyRunning`],
    /// one held by a dead process with [`LockError::StaleLock`]. Neither
    /// touches the filesystem.
    pub fn start(&mut self, detach: &dyn Detach) -> Result<StartOutcome, LockError> {
        self.state = DaemonState::Starting;
        let outcome = self.acquire(detach);
        self.state = match &outcome {
            Ok(StartOutcome::Running(_)) => DaemonState::Running,
            _ => DaemonState::Stopped,
        };
        outcome
    }

    /// Like [`DaemonSupervisor::start`], clearing a stale lock first.
    pub fn force(&mut self, detach: &dyn Detach) -> Result<StartOutcome, LockError> {
        match self.files.lock_state().map_err(LockError::io(self.files.dir()))? {
            LockState::Held(holder) if is_alive(holder.pid) => {
                return Err(LockError::AlreadyRunning { pid: holder.pid });
            }
            LockState::Held(holder) => {
                warn!(pid = holder.pid, "clearing stale lock");
                self.files.remove().map_err(LockError::io(self.files.dir()))?;
            }
            LockState::Garbled => {
                warn!("clearing unreadable lock");
                self.files.remove().map_err(LockError::io(self.files.dir()))?;
            }
            LockState::Free => {}
        }
        self.start(detach)
    }

    /// Asks the running agent to exit, escalating to SIGKILL after the stop
    /// timeout. Files are removed only once the process is gone.
    pub fn stop(&mut self) -> Result<StopOutcome, LockError> {
        let recorded = match self.files.lock_state().map_err(LockError::io(self.files.dir()))? {
            LockState::Held(holder) => Some(holder.pid),
            LockState::Garbled | LockState::Free => self.files.read_pid().map_err(LockError::io(self.files.dir()))?,
        };

        let pid = match recorded {
            Some(pid) if is_alive(pid) => pid,
            stale_pid => {
                self.files.remove().map_err(LockError::io(self.files.dir()))?;
                self.state = DaemonState::Stopped;
                return Ok(StopOutcome::NotRunning { stale_pid });
            }
        };

        self.state = DaemonState::Stopping;
        info!(pid, timeout = ?self.stop_timeout, "stopping agent");
        process::send_signal(pid, SIGTERM).map_err(|source| LockError::Signal { pid, source })?;

        let mut forced = false;
        if !process::wait_for_exit(pid, self.stop_timeout) {
            warn!(pid, "agent ignored SIGTERM, sending SIGKILL");
            process::send_signal(pid, SIGKILL).map_err(|source| LockError::Signal { pid, source })?;
            forced = true;
            if !process::wait_for_exit(pid, KILL_GRACE) {
                self.state = DaemonState::Running;
                return Err(LockError::Unkillable { pid });
            }
        }

        self.files.remove().map_err(LockError::io(self.files.dir()))?;
        self.state = DaemonState::Stopped;
        Ok(StopOutcome::Stopped { pid, forced })
    }

    /// `stop` followed by `start`.
    pub fn restart(&mut self, detach: &dyn Detach) -> Result<(StopOutcome, StartOutcome), LockError> {
        let stopped = self.stop()?;
        Ok((stopped, self.start(detach)?))
    }

    /// Reads the lock without changing anything.
    pub fn status(&self) -> Result<DaemonStatus, LockError> {
        let status = match self.files.lock_state().map_err(LockError::io(self.files.dir()))? {
            LockState::Held(holder) if is_alive(holder.pid) => DaemonStatus::Running { pid: holder.pid },
            LockState::Held(holder) => DaemonStatus::Stopped {
                stale_pid: Some(holder.pid),
            },
            LockState::Garbled | LockState::Free => DaemonStatus::Stopped {
                stale_pid: self.files.read_pid().map_err(LockError::io(self.files.dir()))?,
            },
        };
        Ok(status)
    }

    fn acquire(&mut self, detach: &dyn Detach) -> Result<StartOutcome, LockError> {
        self.files.ensure_dir().map_err(LockError::io(self.files.dir()))?;

        let identity = ProcessIdentity::current();
        if !self.files.try_lock(&identity).map_err(LockError::io(self.files.dir()))? {
            return Err(self.held_lock_error()?);
        }
        debug!(pid = identity.pid, "acquired daemon lock");

        match detach.detach(&self.files) {
            Ok(Detached::Daemon) => {
                let pid = std::process::id() as i32;
                info!(pid, "agent running");
                Ok(StartOutcome::Running(RunningDaemon {
                    files: self.files.clone(),
                    pid,
                    released: false,
                }))
            }
            Ok(Detached::Parent { daemon_pid }) => Ok(StartOutcome::Detached { pid: daemon_pid }),
            Err(err) => {
                self.release_failed_start(identity.pid);
                Err(err)
            }
        }
    }

    /// Removes the lock after a failed detach unless a live daemon already
    /// took it over.
    fn release_failed_start(&self, pid: i32) {
        match self.files.lock_state() {
            Ok(LockState::Held(holder)) if holder.pid != pid && is_alive(holder.pid) => {
                warn!(holder = holder.pid, "start failed after the daemon took over the lock, leaving it in place");
            }
            Ok(_) => {
                if let Err(cleanup) = self.files.remove() {
                    error!(%cleanup, "failed to remove lock after a failed start");
                }
            }
            Err(cleanup) => error!(%cleanup, "failed to read lock after a failed start"),
        }
    }

    fn held_lock_error(&self) -> Result<LockError, LockError> {
        Ok(match self.files.lock_state().map_err(LockError::io(self.files.dir()))? {
            LockState::Held(holder) if is_alive(holder.pid) => LockError::AlreadyRunning { pid: holder.pid },
            LockState::Held(holder) => LockError::StaleLock { pid: Some(holder.pid) },
            LockState::Garbled => LockError::StaleLock { pid: None },
            // released between our attempt and this read
            LockState::Free => LockError::StaleLock { pid: None },
        })
    }
}
