//! PID, lock and identity files of one agent under its daemon directory.

use chrono::{
    DateTime,
    Utc,
};
use sha1::{
    Digest as _,
    Sha1,
};
use std::{
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        self,
        Write as _,
    },
    path::{
        Path,
        PathBuf,
    },
};

/// Who holds the lock, as recorded in the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub lock_acquired_at: DateTime<Utc>,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        Self {
            pid: std::process::id() as i32,
            lock_acquired_at: Utc::now(),
        }
    }

    fn encode(&self) -> String {
        format!("{}\n{}\n", self.pid, self.lock_acquired_at.to_rfc3339())
    }

    fn decode(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let lock_acquired_at = lines
            .next()
            .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_default();
        Some(Self { pid, lock_acquired_at })
    }
}

/// What the lock file says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(ProcessIdentity),
    /// Present but unreadable.
    Garbled,
}

#[derive(Debug, Clone)]
pub struct DaemonFiles {
    dir: PathBuf,
}

impl DaemonFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("lock")
    }

    pub fn agent_id_path(&self) -> PathBuf {
        self.dir.join("agent_id")
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn lock_state(&self) -> io::Result<LockState> {
        match fs::read_to_string(self.lock_path()) {
            Ok(content) => Ok(ProcessIdentity::decode(&content)
                .map(LockState::Held)
                .unwrap_or(LockState::Garbled)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LockState::Free),
            Err(err) => Err(err),
        }
    }

    pub fn read_pid(&self) -> io::Result<Option<i32>> {
        match fs::read_to_string(self.pid_path()) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Creates the lock file. Returns `false` if it already exists.
    pub fn try_lock(&self, identity: &ProcessIdentity) -> io::Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(self.lock_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err),
        };
        file.write_all(identity.encode().as_bytes())?;
        file.sync_all()?;
        Ok(true)
    }

    /// Points the lock and PID files at `identity`. The lock file never
    /// disappears while this happens.
    pub fn take_over(&self, identity: &ProcessIdentity) -> io::Result<()> {
        write_atomically(&self.lock_path(), identity.encode().as_bytes())?;
        write_atomically(&self.pid_path(), format!("{}\n", identity.pid).as_bytes())
    }

    /// Removes the PID and lock files, ignoring ones already gone.
    pub fn remove(&self) -> io::Result<()> {
        for path in [self.pid_path(), self.lock_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// The agent identity, generated on first use and kept afterwards.
    pub fn agent_id(&self, agent_name: &str) -> io::Result<String> {
        let path = self.agent_id_path();
        match fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
            Ok(_) => warn!(path = %path.display(), "empty agent_id file, generating a new identity"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        self.ensure_dir()?;
        let agent_id = generate_agent_id(agent_name);
        write_atomically(&path, agent_id.as_bytes())?;
        info!(%agent_id, "generated agent identity");
        Ok(agent_id)
    }
}

fn generate_agent_id(agent_name: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(agent_name.as_bytes());
    hasher.update(hostname().as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: the buffer outlives the call and its length is passed along.
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if result != 0 {
        return "localhost".to_string();
    }
    let end = buffer.iter().position(|&byte| byte == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp = path.with_extension("tmp");
    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)
}
