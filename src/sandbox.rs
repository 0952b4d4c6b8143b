mod directory;
mod provisioner;

pub use directory::DirectoryProvisioner;
pub use provisioner::Provisioner;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::Mutex;

use crate::config::{IsolationMode, SandboxConfig};
use crate::models::{EnvironmentId, Language, ProjectId};

/// Limits applied to the entry process with `setrlimit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    pub max_processes: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

impl ProcessLimits {
    pub fn is_empty(&self) -> bool {
        self.max_processes.is_none() && self.max_memory_bytes.is_none()
    }

    /// Applies the limits to the calling process
    ///
    /// Runs between `fork` and `exec`, so it only calls async-signal-safe functions.
    pub fn apply(&self) -> std::io::Result<()> {
        if let Some(n) = self.max_processes {
            set_rlimit(libc::RLIMIT_NPROC, n)?;
        }
        if let Some(bytes) = self.max_memory_bytes {
            set_rlimit(libc::RLIMIT_AS, bytes)?;
        }
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialized rlimit for the duration of the call
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A live sandbox owned by the provisioner and borrowed by one execution
///
/// The runner records the process group it launched so teardown can reclaim
/// stray processes even when the run was abandoned midway.
#[derive(Debug)]
pub struct EnvironmentHandle {
    id: EnvironmentId,
    project_id: ProjectId,
    language: Language,
    root: PathBuf,
    command: Vec<String>,
    wrapper: Vec<String>,
    env: Vec<(String, String)>,
    limits: ProcessLimits,
    process_group: Mutex<Option<i32>>,
    torn_down: AtomicBool,
}

impl EnvironmentHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EnvironmentId,
        project_id: ProjectId,
        language: Language,
        root: PathBuf,
        command: Vec<String>,
        wrapper: Vec<String>,
        env: Vec<(String, String)>,
        limits: ProcessLimits,
    ) -> Self {
        Self {
            id,
            project_id,
            language,
            root,
            command,
            wrapper,
            env,
            limits,
            process_group: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Filesystem root of the sandbox; also the working directory and `HOME`
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn limits(&self) -> ProcessLimits {
        self.limits
    }

    /// Full argv launching `entry`, including any isolation wrapper
    pub fn command_for(&self, entry: &str) -> Vec<String> {
        self.wrapper
            .iter()
            .cloned()
            .chain(self.command.iter().map(|s| s.replace("%ENTRY%", entry)))
            .collect()
    }

    pub fn process_group(&self) -> Option<i32> {
        *self.process_group.lock()
    }

    pub(crate) fn set_process_group(&self, pgid: Option<i32>) {
        *self.process_group.lock() = pgid;
    }

    pub(crate) fn take_process_group(&self) -> Option<i32> {
        self.process_group.lock().take()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Marks the handle torn down, returning whether it already was
    pub(crate) fn mark_torn_down(&self) -> bool {
        self.torn_down.swap(true, Ordering::SeqCst)
    }
}

/// Sends `signal` to every process in the group `pgid`
///
/// Returns false when the group no longer exists.
pub(crate) fn signal_group(pgid: i32, signal: libc::c_int) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid addresses the group
    unsafe { libc::kill(-pgid, signal) == 0 }
}

/// Looks `program` up the way `execvp` would
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        p.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Creates the provisioner described by the sandbox configuration
///
/// In `unshare` mode the `unshare` binary must be available, otherwise the
/// engine refuses to start rather than silently running without namespaces.
pub fn create_provisioner(
    config: &SandboxConfig,
    languages: crate::config::LanguageConfig,
) -> Result<DirectoryProvisioner> {
    if config.isolation == IsolationMode::Unshare && find_in_path("unshare").is_none() {
        anyhow::bail!("isolation mode `unshare` requested but `unshare` is not on PATH");
    }

    let root = config.root_dir()?;
    match config.isolation {
        IsolationMode::None => {
            log::info!("Creating DirectoryProvisioner at {} (no namespaces)", root.display());
            log::warn!(
                "Sandboxes share the host network and pid namespace - use only for trusted code"
            );
        }
        IsolationMode::Unshare => {
            log::info!("Creating DirectoryProvisioner at {} (unshare namespaces)", root.display());
        }
    }

    DirectoryProvisioner::build(root, config.clone(), languages)
}
