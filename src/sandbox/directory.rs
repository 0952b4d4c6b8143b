use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{IsolationMode, LanguageConfig, SandboxConfig};
use crate::error::ProvisionError;
use crate::lease::{LEASE_EXTENSION, Lease, lease_id};
use crate::models::{EnvironmentId, EnvironmentRecord, File, Language, normalize_file_path};

use super::{EnvironmentHandle, ProcessLimits, Provisioner, find_in_path, signal_group};

const SANDBOX_DIR_PERMISSIONS: u32 = 0o700;
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const UNSHARE_WRAPPER: &[&str] = &[
    "unshare",
    "--user",
    "--map-root-user",
    "--net",
    "--pid",
    "--fork",
    "--mount",
    "--mount-proc",
];

/// Provisions each sandbox as a private directory on the host
///
/// The entry process runs with the directory as working directory and `HOME`,
/// a scrubbed environment, and its own process group. With
/// `IsolationMode::Unshare` it additionally gets fresh namespaces.
///
/// Each sandbox `<root>/<id>` is paired with a lease `<root>/<id>.lock` held
/// while it is live. Only sandboxes whose lease can be taken over are ever
/// reclaimed, so other engines sharing the root and unrelated entries are left
/// alone.
pub struct DirectoryProvisioner {
    /// Directory holding one subdirectory per live sandbox
    root: PathBuf,
    config: SandboxConfig,
    languages: LanguageConfig,
    leases: Mutex<HashMap<EnvironmentId, Lease>>,
}

impl DirectoryProvisioner {
    pub fn build(root: PathBuf, config: SandboxConfig, languages: LanguageConfig) -> Result<Self> {
        if !root.exists() {
            fs::create_dir_all(&root)?;
            fs::set_permissions(&root, fs::Permissions::from_mode(SANDBOX_DIR_PERMISSIONS))?;
        }

        let provisioner = Self {
            root,
            config,
            languages,
            leases: Mutex::new(HashMap::new()),
        };
        provisioner.reclaim_leftovers();

        log::info!(
            "DirectoryProvisioner initialized at {}",
            provisioner.root.display()
        );
        Ok(provisioner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lease_path(&self, id: EnvironmentId) -> PathBuf {
        self.root.join(format!("{id}.{LEASE_EXTENSION}"))
    }

    /// Removes sandboxes whose owning process died without tearing them down
    fn reclaim_leftovers(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(lease_id) else {
                continue;
            };

            let lease = match Lease::try_take(&entry.path()) {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    log::debug!("Sandbox {id} is in use by a live engine");
                    continue;
                }
                Err(e) => {
                    log::warn!("Failed to inspect lease of sandbox {id}: {e}");
                    continue;
                }
            };

            let dir = self.root.join(id.to_string());
            if dir.is_dir() {
                log::warn!("Reclaiming leftover sandbox {}", dir.display());
                if let Err(e) = force_remove_dir(&dir) {
                    log::error!("Failed to reclaim leftover sandbox {}: {e}", dir.display());
                    continue;
                }
            }
            if let Err(e) = lease.release() {
                log::warn!("Failed to remove lease of sandbox {id}: {e}");
            }
        }
    }

    /// Checks the snapshot against the sandbox reservations before touching disk
    fn check_reservations(&self, files: &[File]) -> Result<(), ProvisionError> {
        if files.len() > self.config.max_files {
            return Err(ProvisionError::ResourceLimit(format!(
                "{} files exceed the limit of {}",
                files.len(),
                self.config.max_files
            )));
        }

        let total: u64 = files.iter().map(|f| f.content.len() as u64).sum();
        if total > self.config.max_disk_bytes.0 {
            return Err(ProvisionError::ResourceLimit(format!(
                "{total} bytes of files exceed the disk limit of {} bytes",
                self.config.max_disk_bytes.0
            )));
        }

        Ok(())
    }

    /// Verifies the interpreter (and namespace wrapper) can be launched
    fn check_runtime(&self, language: Language, command: &[String]) -> Result<(), ProvisionError> {
        let program = command
            .first()
            .ok_or_else(|| ProvisionError::UnknownLanguage(language.to_string()))?;
        if find_in_path(program).is_none() {
            return Err(ProvisionError::RuntimeUnavailable {
                language: language.to_string(),
                program: program.clone(),
            });
        }

        if self.config.isolation == IsolationMode::Unshare && find_in_path("unshare").is_none() {
            return Err(ProvisionError::RuntimeUnavailable {
                language: language.to_string(),
                program: "unshare".to_string(),
            });
        }
        Ok(())
    }

    fn environment_for(&self, root: &Path, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            ),
            ("HOME".to_string(), root.to_string_lossy().into_owned()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(extra.iter().cloned());
        env
    }
}

/// Writes the snapshot into `dir`, rejecting paths that escape it
fn populate(dir: &Path, files: &[File]) -> Result<(), ProvisionError> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(SANDBOX_DIR_PERMISSIONS))?;

    for file in files {
        let relative = normalize_file_path(&file.path)
            .ok_or_else(|| ProvisionError::InvalidPath(file.path.clone()))?;
        let target = dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &file.content)?;
    }
    Ok(())
}

/// Removes `dir`, restoring write permission on the way if the program stripped it
fn force_remove_dir(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => log::warn!("First removal of {} failed ({e}), fixing permissions", dir.display()),
    }

    restore_permissions(dir);
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn restore_permissions(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    if !meta.is_dir() {
        return;
    }
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            restore_permissions(&entry.path());
        }
    }
}

#[async_trait]
impl Provisioner for DirectoryProvisioner {
    async fn provision(
        &self,
        env: &EnvironmentRecord,
        language: Language,
        files: &[File],
    ) -> Result<Arc<EnvironmentHandle>, ProvisionError> {
        let launch = self
            .languages
            .get(language)
            .ok_or_else(|| ProvisionError::UnknownLanguage(language.to_string()))?;
        self.check_runtime(language, &launch.command)?;
        self.check_reservations(files)?;

        // The lease exists before the directory, so a live sandbox is never reclaimable
        let lease = Lease::create(&self.lease_path(env.id))?;
        let dir = self.root.join(env.id.to_string());
        let files = files.to_vec();
        let target = dir.clone();
        let populated = tokio::task::spawn_blocking(move || populate(&target, &files))
            .await
            .map_err(|e| ProvisionError::Io(std::io::Error::other(e)))
            .and_then(|populated| populated);

        if let Err(e) = populated {
            match force_remove_dir(&dir) {
                Ok(()) => {
                    if let Err(e) = lease.release() {
                        log::warn!("Failed to remove lease of sandbox {}: {e}", env.id);
                    }
                }
                Err(cleanup) => {
                    log::error!("Failed to clean partial sandbox {}: {cleanup}", dir.display())
                }
            }
            return Err(e);
        }
        self.leases.lock().insert(env.id, lease);

        let wrapper = match self.config.isolation {
            IsolationMode::None => Vec::new(),
            IsolationMode::Unshare => UNSHARE_WRAPPER.iter().map(|s| s.to_string()).collect(),
        };
        let mut extra: Vec<_> = launch
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        extra.sort();

        let limits = ProcessLimits {
            max_processes: self.config.max_processes,
            max_memory_bytes: self.config.max_memory_bytes.map(|b| b.0),
        };

        log::debug!(
            "Provisioned sandbox {} for project {} at {}",
            env.id,
            env.project_id,
            dir.display()
        );

        Ok(Arc::new(EnvironmentHandle::new(
            env.id,
            env.project_id,
            language,
            dir.clone(),
            launch.command.clone(),
            wrapper,
            self.environment_for(&dir, &extra),
            limits,
        )))
    }

    async fn teardown(&self, handle: &EnvironmentHandle) -> Result<(), ProvisionError> {
        if handle.mark_torn_down() {
            log::debug!("Sandbox {} already torn down", handle.id());
            return Ok(());
        }

        let pgid = handle.take_process_group();
        if let Some(pgid) = pgid.filter(|&pgid| signal_group(pgid, libc::SIGKILL)) {
            log::warn!(
                "Killed stray processes of group {pgid} in sandbox {}",
                handle.id()
            );
            // Let the kernel finish reaping before the directory goes away
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let dir = handle.root().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || force_remove_dir(&dir))
            .await
            .map_err(|e| ProvisionError::Io(std::io::Error::other(e)))?;

        // Without a release the lease file stays behind for the next reclaim
        let lease = self.leases.lock().remove(&handle.id());
        match removed {
            Ok(()) => {
                if let Some(Err(e)) = lease.map(Lease::release) {
                    log::warn!("Failed to remove lease of sandbox {}: {e}", handle.id());
                }
                log::debug!("Sandbox {} torn down", handle.id());
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Failed to remove sandbox {} at {}: {e}",
                    handle.id(),
                    handle.root().display()
                );
                Err(ProvisionError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteSize, OneLanguageConfig};
    use chrono::Utc;
    use uuid::Uuid;

    fn shell_languages() -> LanguageConfig {
        let mut languages = LanguageConfig::default();
        languages.set(OneLanguageConfig {
            language: Language::Python,
            command: vec!["/bin/sh".to_string(), "%ENTRY%".to_string()],
            env: Default::default(),
        });
        languages
    }

    fn file(path: &str, content: &str) -> File {
        File {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            path: path.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn env_record() -> EnvironmentRecord {
        EnvironmentRecord {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            created_at: Utc::now(),
            released_at: None,
        }
    }

    #[tokio::test]
    async fn test_provision_populates_and_teardown_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::build(
            tmp.path().join("sandboxes"),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();

        let files = vec![file("main.py", "echo hi"), file("lib/util.sh", "true")];
        let handle = provisioner
            .provision(&env_record(), Language::Python, &files)
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(handle.root().join("lib/util.sh")).unwrap(),
            "true"
        );
        assert!(handle.env().iter().any(|(k, _)| k == "HOME"));

        provisioner.teardown(&handle).await.unwrap();
        assert!(!handle.root().exists());
        // Second teardown is a no-op
        provisioner.teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_provision_rejects_escaping_path() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();

        let env = env_record();
        let err = provisioner
            .provision(&env, Language::Python, &[file("../evil.sh", "rm -rf /")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPath(_)));
        assert!(!tmp.path().join(env.id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_provision_enforces_reservations() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            max_files: 1,
            max_disk_bytes: ByteSize(4),
            ..SandboxConfig::default()
        };
        let provisioner =
            DirectoryProvisioner::build(tmp.path().to_path_buf(), config, shell_languages())
                .unwrap();

        let too_many = provisioner
            .provision(
                &env_record(),
                Language::Python,
                &[file("a", ""), file("b", "")],
            )
            .await
            .unwrap_err();
        assert!(matches!(too_many, ProvisionError::ResourceLimit(_)));

        let too_big = provisioner
            .provision(&env_record(), Language::Python, &[file("a", "12345")])
            .await
            .unwrap_err();
        assert!(matches!(too_big, ProvisionError::ResourceLimit(_)));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut languages = LanguageConfig::default();
        languages.set(OneLanguageConfig {
            language: Language::Ruby,
            command: vec!["no-such-ruby-rexec".to_string(), "%ENTRY%".to_string()],
            env: Default::default(),
        });
        let provisioner = DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            languages,
        )
        .unwrap();

        let err = provisioner
            .provision(&env_record(), Language::Ruby, &[file("main.rb", "puts 1")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::RuntimeUnavailable { .. }));
    }

    #[test]
    fn test_build_reclaims_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let leftover = tmp.path().join(id.to_string());
        fs::create_dir_all(leftover.join("nested")).unwrap();
        fs::write(leftover.join("nested/file"), "x").unwrap();
        fs::set_permissions(leftover.join("nested"), fs::Permissions::from_mode(0o500)).unwrap();
        // Lease file of a process that died without tearing down
        let lease = tmp.path().join(format!("{id}.lock"));
        fs::write(&lease, "").unwrap();

        DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();
        assert!(!leftover.exists());
        assert!(!lease.exists());
    }

    #[test]
    fn test_build_leaves_unrelated_entries_alone() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("my-notes")).unwrap();
        fs::write(tmp.path().join("my-notes/todo.txt"), "keep me").unwrap();
        // UUID-named but without a lease, so not ours
        let foreign = tmp.path().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&foreign).unwrap();
        let before = fs::metadata(tmp.path()).unwrap().permissions().mode();

        DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("my-notes/todo.txt")).unwrap(),
            "keep me"
        );
        assert!(foreign.exists());
        assert_eq!(fs::metadata(tmp.path()).unwrap().permissions().mode(), before);
    }

    #[tokio::test]
    async fn test_live_sandbox_survives_second_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let first = DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();
        let handle = first
            .provision(&env_record(), Language::Python, &[file("main.py", "echo hi")])
            .await
            .unwrap();

        let _second = DirectoryProvisioner::build(
            tmp.path().to_path_buf(),
            SandboxConfig::default(),
            shell_languages(),
        )
        .unwrap();
        assert!(handle.root().join("main.py").exists());

        first.teardown(&handle).await.unwrap();
        assert!(!handle.root().exists());
        assert!(!tmp.path().join(format!("{}.lock", handle.id())).exists());
    }
}
