use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{
    EnvironmentId, EnvironmentRecord, ExecutionId, ExecutionRecord, File, FileId, NewFile,
    NewProject, Project, ProjectId, normalize_file_path,
};

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence boundary of the engine
///
/// Every call is atomic on its own. `list_files` must return a consistent view
/// of the project's files at the moment of the call, ordered by path.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_project(&self, project: NewProject) -> StorageResult<Project>;

    async fn get_project(&self, id: ProjectId) -> StorageResult<Project>;

    /// Projects of one owner, oldest first
    async fn list_projects(&self, owner_id: &str) -> StorageResult<Vec<Project>>;

    /// Deletes the project with its files, environments and executions
    async fn delete_project(&self, id: ProjectId) -> StorageResult<()>;

    /// Inserts a file, or replaces the content of the file at the same path
    async fn save_file(&self, file: NewFile) -> StorageResult<File>;

    async fn get_file(&self, id: FileId) -> StorageResult<File>;

    async fn delete_file(&self, id: FileId) -> StorageResult<()>;

    async fn list_files(&self, project_id: ProjectId) -> StorageResult<Vec<File>>;

    async fn create_execution(&self, record: &ExecutionRecord) -> StorageResult<()>;

    async fn update_execution(&self, record: &ExecutionRecord) -> StorageResult<()>;

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord>;

    /// Executions of one project in creation order
    async fn list_executions(&self, project_id: ProjectId) -> StorageResult<Vec<ExecutionRecord>>;

    /// Executions still QUEUED or RUNNING, across all projects
    async fn list_unfinished_executions(&self) -> StorageResult<Vec<ExecutionRecord>>;

    async fn create_environment(&self, project_id: ProjectId) -> StorageResult<EnvironmentRecord>;

    async fn release_environment(&self, id: EnvironmentId) -> StorageResult<()>;
}

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    files: HashMap<ProjectId, Vec<File>>,
    executions: HashMap<ExecutionId, ExecutionRecord>,
    environments: HashMap<EnvironmentId, EnvironmentRecord>,
}

/// In-process storage
///
/// Used by tests and by embedders that do not need durability. Execution
/// updates can be made to fail on purpose to exercise retry handling.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    failing_updates: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `update_execution` fail
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn environments(&self, project_id: ProjectId) -> Vec<EnvironmentRecord> {
        let tables = self.tables.lock();
        let mut envs: Vec<_> = tables
            .environments
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        envs.sort_by_key(|e| e.created_at);
        envs
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_project(&self, project: NewProject) -> StorageResult<Project> {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            name: project.name,
            description: project.description,
            language: project.language,
            owner_id: project.owner_id,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .lock()
            .projects
            .insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> StorageResult<Project> {
        self.tables
            .lock()
            .projects
            .get(&id)
            .cloned()
            .ok_or(StorageError::ProjectNotFound(id))
    }

    async fn list_projects(&self, owner_id: &str) -> StorageResult<Vec<Project>> {
        let tables = self.tables.lock();
        let mut projects: Vec<_> = tables
            .projects
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        projects.sort_by_key(|p| (p.created_at, p.id));
        Ok(projects)
    }

    async fn delete_project(&self, id: ProjectId) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        if tables.projects.remove(&id).is_none() {
            return Err(StorageError::ProjectNotFound(id));
        }
        tables.files.remove(&id);
        tables.executions.retain(|_, e| e.project_id != id);
        tables.environments.retain(|_, e| e.project_id != id);
        Ok(())
    }

    async fn save_file(&self, file: NewFile) -> StorageResult<File> {
        let path = normalize_file_path(&file.path)
            .ok_or_else(|| StorageError::InvalidPath(file.path.clone()))?;

        let mut tables = self.tables.lock();
        if !tables.projects.contains_key(&file.project_id) {
            return Err(StorageError::ProjectNotFound(file.project_id));
        }

        let now = Utc::now();
        let files = tables.files.entry(file.project_id).or_default();
        if let Some(existing) = files.iter_mut().find(|f| f.path == path) {
            existing.content = file.content;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let created = File {
            id: Uuid::new_v4(),
            project_id: file.project_id,
            path,
            content: file.content,
            created_at: now,
            updated_at: now,
        };
        files.push(created.clone());
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(created)
    }

    async fn get_file(&self, id: FileId) -> StorageResult<File> {
        self.tables
            .lock()
            .files
            .values()
            .flatten()
            .find(|f| f.id == id)
            .cloned()
            .ok_or(StorageError::FileNotFound(id))
    }

    async fn delete_file(&self, id: FileId) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        for files in tables.files.values_mut() {
            if let Some(pos) = files.iter().position(|f| f.id == id) {
                files.remove(pos);
                return Ok(());
            }
        }
        Err(StorageError::FileNotFound(id))
    }

    async fn list_files(&self, project_id: ProjectId) -> StorageResult<Vec<File>> {
        let tables = self.tables.lock();
        if !tables.projects.contains_key(&project_id) {
            return Err(StorageError::ProjectNotFound(project_id));
        }
        Ok(tables.files.get(&project_id).cloned().unwrap_or_default())
    }

    async fn create_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        if !tables.projects.contains_key(&record.project_id) {
            return Err(StorageError::ProjectNotFound(record.project_id));
        }
        tables.executions.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        if self.take_injected_failure() {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        let mut tables = self.tables.lock();
        match tables.executions.get_mut(&record.id) {
            Some(existing) if existing.is_terminal() => {
                Err(StorageError::ExecutionTerminal(record.id))
            }
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::ExecutionNotFound(record.id)),
        }
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord> {
        self.tables
            .lock()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StorageError::ExecutionNotFound(id))
    }

    async fn list_executions(&self, project_id: ProjectId) -> StorageResult<Vec<ExecutionRecord>> {
        let tables = self.tables.lock();
        let mut records: Vec<_> = tables
            .executions
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by_key(|e| e.created_at);
        Ok(records)
    }

    async fn list_unfinished_executions(&self) -> StorageResult<Vec<ExecutionRecord>> {
        let tables = self.tables.lock();
        let mut records: Vec<_> = tables
            .executions
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|e| e.created_at);
        Ok(records)
    }

    async fn create_environment(&self, project_id: ProjectId) -> StorageResult<EnvironmentRecord> {
        let mut tables = self.tables.lock();
        if !tables.projects.contains_key(&project_id) {
            return Err(StorageError::ProjectNotFound(project_id));
        }
        let record = EnvironmentRecord {
            id: Uuid::new_v4(),
            project_id,
            created_at: Utc::now(),
            released_at: None,
        };
        tables.environments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn release_environment(&self, id: EnvironmentId) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        let env = tables
            .environments
            .get_mut(&id)
            .ok_or(StorageError::EnvironmentNotFound(id))?;
        env.released_at.get_or_insert_with(Utc::now);
        Ok(())
    }
}
