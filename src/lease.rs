//! Advisory `flock` leases
//!
//! A lease is a file holding an exclusive lock for as long as its owner lives.
//! The kernel drops the lock when the owner exits, however it exits, so a lease
//! file that can be locked by someone else belongs to a dead owner.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub const LEASE_EXTENSION: &str = "lock";

/// Applies `operation` to the lock of `file`
///
/// Returns false when a non-blocking request would have blocked.
fn flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    // Held only for its lock
    _file: File,
}

impl Lease {
    /// Creates `path` already locked
    ///
    /// The file is locked under a temporary name and renamed into place, so
    /// nobody can observe it unlocked.
    pub fn create(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lease path has no name"))?;
        let staging = path.with_file_name(format!(
            ".{}.{}.tmp",
            name.to_string_lossy(),
            Uuid::new_v4()
        ));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)?;
        let placed = flock(&file, libc::LOCK_EX | libc::LOCK_NB).and_then(|locked| {
            if !locked {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "fresh lease file is locked",
                ));
            }
            fs::rename(&staging, path)
        });
        if let Err(e) = placed {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Takes over the lease at `path` if its owner is gone
    ///
    /// `None` while the owner still holds it, or when the file has vanished.
    pub fn try_take(path: &Path) -> io::Result<Option<Self>> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !flock(&file, libc::LOCK_EX | libc::LOCK_NB)? {
            return Ok(None);
        }
        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lease file, then drops the lock
    pub fn release(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Lease id encoded in a file name like `<uuid>.lock`
pub fn lease_id(file_name: &str) -> Option<Uuid> {
    let stem = file_name.strip_suffix(LEASE_EXTENSION)?.strip_suffix('.')?;
    Uuid::parse_str(stem).ok()
}

/// Membership of one engine among all engines sharing a database
///
/// Each engine holds `<dir>/<engine id>.lock`. Executions left unfinished in
/// storage are only orphans when no other engine is alive to own them.
#[derive(Debug)]
pub struct EngineLease {
    id: Uuid,
    dir: PathBuf,
    own: Lease,
}

impl EngineLease {
    pub fn acquire(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let id = Uuid::new_v4();
        let own = Lease::create(&dir.join(format!("{id}.{LEASE_EXTENSION}")))?;
        log::debug!("Engine {id} holds lease {}", own.path().display());
        Ok(Self { id, dir, own })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether any other engine currently holds a lease in the same directory
    ///
    /// Leases of dead engines found on the way are cleared.
    pub fn others_alive(&self) -> io::Result<bool> {
        let mut alive = false;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(other) = name.to_str().and_then(lease_id) else {
                continue;
            };
            if other == self.id {
                continue;
            }

            match Lease::try_take(&entry.path())? {
                Some(stale) => {
                    log::info!("Clearing lease of dead engine {other}");
                    stale.release()?;
                }
                None => {
                    log::debug!("Engine {other} is alive");
                    alive = true;
                }
            }
        }
        Ok(alive)
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.own.path()) {
            log::warn!("Failed to remove engine lease {}: {e}", self.own.path().display());
        }
    }
}
