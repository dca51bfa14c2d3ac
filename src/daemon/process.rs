use super::{
    files::{
        DaemonFiles,
        ProcessIdentity,
    },
    LockError,
};
use std::{
    fs::File,
    io::{
        self,
        Read as _,
        Write,
    },
    os::fd::{
        AsRawFd as _,
        FromRawFd as _,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `kill(pid, 0)`: the process exists, even if we may not signal it.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Sends `signal`. A process that is already gone is not an error.
pub fn send_signal(pid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: plain syscall without memory arguments.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Polls until `pid` is gone. Returns whether it exited within `timeout`.
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
    true
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Which side of a detach the caller ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The invoking process. The daemon runs elsewhere and holds the lock.
    Parent { daemon_pid: i32 },
    /// The process that should run the agent.
    Daemon,
}

/// How a started agent leaves the invoking session.
///
/// Implementations must leave the lock and PID files naming the process
/// that returns [`Detached::Daemon`] before any caller returns.
pub trait Detach {
    fn detach(&self, files: &DaemonFiles) -> Result<Detached, LockError>;
}

/// Keeps running in the invoking process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Foreground;

impl Detach for Foreground {
    fn detach(&self, files: &DaemonFiles) -> Result<Detached, LockError> {
        files
            .take_over(&ProcessIdentity::current())
            .map_err(LockError::io(files.dir()))?;
        Ok(Detached::Daemon)
    }
}

/// Classic double fork with `setsid`.
///
/// The invoking process only returns once the grandchild has rewritten the
/// lock with its own PID, reported over a pipe.
///
/// Must run before any threads are started, i.e. before the async runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleFork;

impl Detach for DoubleFork {
    fn detach(&self, files: &DaemonFiles) -> Result<Detached, LockError> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(LockError::Detach(io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        // SAFETY: no other threads exist yet, so the child inherits a
        // consistent copy of the process state.
        match unsafe { libc::fork() } {
            -1 => Err(LockError::Detach(io::Error::last_os_error())),
            0 => {
                // SAFETY: closing our copy of the read end.
                unsafe { libc::close(read_fd) };
                // SAFETY: the descriptor is owned by this process from here on.
                let mut report = unsafe { File::from_raw_fd(write_fd) };
                Ok(Self::become_daemon(files, &mut report))
            }
            child => {
                // SAFETY: closing our copy of the write end.
                unsafe { libc::close(write_fd) };
                // SAFETY: the descriptor is owned by this process from here on.
                let mut handshake = unsafe { File::from_raw_fd(read_fd) };
                let mut status = 0;
                // SAFETY: reaping the intermediate child, which exits right away.
                unsafe { libc::waitpid(child, &mut status, 0) };

                let mut reply = [0u8; 4];
                handshake.read_exact(&mut reply).map_err(LockError::Detach)?;
                match i32::from_le_bytes(reply) {
                    pid if pid > 0 => Ok(Detached::Parent { daemon_pid: pid }),
                    _ => Err(LockError::Detach(io::Error::other(
                        "daemon failed to take over the lock",
                    ))),
                }
            }
        }
    }
}

impl DoubleFork {
    /// Runs in the first child. Only the grandchild returns.
    fn become_daemon(files: &DaemonFiles, report: &mut File) -> Detached {
        // SAFETY: plain syscalls on the current process.
        unsafe {
            libc::setsid();
            match libc::fork() {
                -1 => {
                    let _ = report.write_all(&0i32.to_le_bytes());
                    libc::_exit(1);
                }
                0 => {}
                _ => libc::_exit(0),
            }
            libc::umask(0o027);
        }

        let _ = std::env::set_current_dir("/");
        redirect_std_streams();

        if !Self::hand_over(files, &ProcessIdentity::current(), report) {
            // SAFETY: leaving without running destructors of the parent state.
            unsafe { libc::_exit(1) };
        }
        Detached::Daemon
    }

    /// Takes over the lock and reports the new PID, or 0 on failure, to the
    /// invoking process. Returns whether the caller may go on as the daemon.
    /// A lock whose PID never reached the invoking process is released again.
    fn hand_over(files: &DaemonFiles, identity: &ProcessIdentity, report: &mut dyn Write) -> bool {
        let took_over = files.take_over(identity).is_ok();
        let reply = if took_over { identity.pid } else { 0 };
        let delivered = report.write_all(&reply.to_le_bytes()).and_then(|()| report.flush()).is_ok();

        if took_over && !delivered {
            let _ = files.remove();
        }
        took_over && delivered
    }
}

fn redirect_std_streams() {
    let Ok(null) = File::options().read(true).write(true).open("/dev/null") else {
        return;
    };
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid; dup2 replaces the target atomically.
        unsafe { libc::dup2(null.as_raw_fd(), target) };
    }
}
