use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{
    EnvironmentId, EnvironmentRecord, ExecutionId, ExecutionRecord, ExecutionStatus, File, FileId,
    Language, NewFile, NewProject, Project, ProjectId, normalize_file_path,
};
use crate::storage::{Storage, StorageResult};

const DATABASE_NAME: &str = "rexec.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "rexec")
        .ok_or_else(|| anyhow::anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-connection settings, must be applied outside a transaction
                for pragma_sql in &[
                    "PRAGMA foreign_keys = ON;",
                    "PRAGMA busy_timeout = 2000;",
                    "PRAGMA journal_mode = WAL;",
                    "PRAGMA synchronous = NORMAL;",
                ] {
                    sqlx::query(pragma_sql).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS projects (
            id            TEXT     PRIMARY KEY,
            name          TEXT     NOT NULL,
            description   TEXT,
            language      TEXT     NOT NULL,
            owner_id      TEXT     NOT NULL,
            created_at    TEXT     NOT NULL,
            updated_at    TEXT     NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS files (
            id            TEXT     PRIMARY KEY,
            project_id    TEXT     NOT NULL,
            path          TEXT     NOT NULL,
            content       TEXT     NOT NULL,
            created_at    TEXT     NOT NULL,
            updated_at    TEXT     NOT NULL,
            UNIQUE (project_id, path),
            FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
        );",
        r"
        CREATE TABLE IF NOT EXISTS environments (
            id            TEXT     PRIMARY KEY,
            project_id    TEXT     NOT NULL,
            created_at    TEXT     NOT NULL,
            released_at   TEXT,
            FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
        );",
        r"
        CREATE TABLE IF NOT EXISTS executions (
            seq           INTEGER  PRIMARY KEY AUTOINCREMENT,
            id            TEXT     NOT NULL UNIQUE,
            project_id    TEXT     NOT NULL,
            entry_file    TEXT     NOT NULL,
            status        TEXT     NOT NULL CHECK (status IN ('QUEUED', 'RUNNING', 'COMPLETED', 'ERROR')),
            stdout        TEXT     NOT NULL DEFAULT '',
            stderr        TEXT     NOT NULL DEFAULT '',
            exit_code     INTEGER,
            created_at    TEXT     NOT NULL,
            started_at    TEXT,
            completed_at  TEXT,
            memory_usage  REAL,
            cpu_time      REAL,
            FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
        );",
        "CREATE INDEX IF NOT EXISTS idx_executions_project ON executions(project_id, seq);",
        "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);",
    ] {
        sqlx::query(sql).execute(&mut *tx).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// `Storage` backed by a SQLite database
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::new(init_db(db_path).await?))
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_timestamp(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

fn parse_uuid(s: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("bad id {s:?}: {e}")))
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    description: Option<String>,
    language: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ProjectRow> for Project {
    type Error = StorageError;

    fn try_from(row: ProjectRow) -> StorageResult<Self> {
        Ok(Project {
            id: parse_uuid(&row.id)?,
            name: row.name,
            description: row.description,
            language: Language::from_str(&row.language).map_err(StorageError::Corrupt)?,
            owner_id: row.owner_id,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    project_id: String,
    path: String,
    content: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<FileRow> for File {
    type Error = StorageError;

    fn try_from(row: FileRow) -> StorageResult<Self> {
        Ok(File {
            id: parse_uuid(&row.id)?,
            project_id: parse_uuid(&row.project_id)?,
            path: row.path,
            content: row.content,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    project_id: String,
    entry_file: String,
    status: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    memory_usage: Option<f64>,
    cpu_time: Option<f64>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = StorageError;

    fn try_from(row: ExecutionRow) -> StorageResult<Self> {
        Ok(ExecutionRecord {
            id: parse_uuid(&row.id)?,
            project_id: parse_uuid(&row.project_id)?,
            entry_file: row.entry_file,
            status: ExecutionStatus::from_str(&row.status).map_err(StorageError::Corrupt)?,
            stdout: row.stdout,
            stderr: row.stderr,
            exit_code: row.exit_code.map(|c| c as i32),
            created_at: parse_timestamp(&row.created_at)?,
            started_at: parse_optional_timestamp(row.started_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
            memory_usage: row.memory_usage,
            cpu_time: row.cpu_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    project_id: String,
    created_at: String,
    released_at: Option<String>,
}

impl TryFrom<EnvironmentRow> for EnvironmentRecord {
    type Error = StorageError;

    fn try_from(row: EnvironmentRow) -> StorageResult<Self> {
        Ok(EnvironmentRecord {
            id: parse_uuid(&row.id)?,
            project_id: parse_uuid(&row.project_id)?,
            created_at: parse_timestamp(&row.created_at)?,
            released_at: parse_optional_timestamp(row.released_at)?,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, project_id, entry_file, status, stdout, stderr, exit_code, \
     created_at, started_at, completed_at, memory_usage, cpu_time";

impl SqliteStorage {
    async fn project_exists(&self, id: ProjectId) -> StorageResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_environment(&self, id: EnvironmentId) -> StorageResult<EnvironmentRecord> {
        let row: Option<EnvironmentRow> = sqlx::query_as(
            "SELECT id, project_id, created_at, released_at FROM environments WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StorageError::EnvironmentNotFound(id))?.try_into()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
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

        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, language, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.language.as_str())
        .bind(&project.owner_id)
        .bind(timestamp(&project.created_at))
        .bind(timestamp(&project.updated_at))
        .execute(&self.pool)
        .await?;

        log::debug!("Inserted project {} into database", project.id);
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> StorageResult<Project> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, language, owner_id, created_at, updated_at
            FROM projects
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StorageError::ProjectNotFound(id))?.try_into()
    }

    async fn list_projects(&self, owner_id: &str) -> StorageResult<Vec<Project>> {
        let rows: Vec<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, language, owner_id, created_at, updated_at
            FROM projects
            WHERE owner_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Project::try_from).collect()
    }

    async fn delete_project(&self, id: ProjectId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ProjectNotFound(id));
        }
        log::info!("Deleted project {id} and its dependents");
        Ok(())
    }

    async fn save_file(&self, file: NewFile) -> StorageResult<File> {
        let path = normalize_file_path(&file.path)
            .ok_or_else(|| StorageError::InvalidPath(file.path.clone()))?;
        if !self.project_exists(file.project_id).await? {
            return Err(StorageError::ProjectNotFound(file.project_id));
        }

        let now = timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (id, project_id, path, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, path)
            DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(file.project_id.to_string())
        .bind(&path)
        .bind(&file.content)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let row: FileRow = sqlx::query_as(
            r#"
            SELECT id, project_id, path, content, created_at, updated_at
            FROM files
            WHERE project_id = ? AND path = ?
            "#,
        )
        .bind(file.project_id.to_string())
        .bind(&path)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_file(&self, id: FileId) -> StorageResult<File> {
        let row: Option<FileRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, path, content, created_at, updated_at
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StorageError::FileNotFound(id))?.try_into()
    }

    async fn delete_file(&self, id: FileId) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::FileNotFound(id));
        }
        log::debug!("Deleted file {id}");
        Ok(())
    }

    async fn list_files(&self, project_id: ProjectId) -> StorageResult<Vec<File>> {
        // Read existence and rows in one transaction so the snapshot is consistent
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM projects WHERE id = ?")
            .bind(project_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::ProjectNotFound(project_id));
        }

        let rows: Vec<FileRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, path, content, created_at, updated_at
            FROM files
            WHERE project_id = ?
            ORDER BY path
            "#,
        )
        .bind(project_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        rows.into_iter().map(File::try_from).collect()
    }

    async fn create_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        if !self.project_exists(record.project_id).await? {
            return Err(StorageError::ProjectNotFound(record.project_id));
        }

        sqlx::query(
            r#"
            INSERT INTO executions (id, project_id, entry_file, status, stdout, stderr, exit_code,
                                    created_at, started_at, completed_at, memory_usage, cpu_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.project_id.to_string())
        .bind(&record.entry_file)
        .bind(record.status.as_str())
        .bind(&record.stdout)
        .bind(&record.stderr)
        .bind(record.exit_code.map(i64::from))
        .bind(timestamp(&record.created_at))
        .bind(record.started_at.as_ref().map(timestamp))
        .bind(record.completed_at.as_ref().map(timestamp))
        .bind(record.memory_usage)
        .bind(record.cpu_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, stdout = ?, stderr = ?, exit_code = ?,
                started_at = ?, completed_at = ?, memory_usage = ?, cpu_time = ?
            WHERE id = ? AND status NOT IN ('COMPLETED', 'ERROR')
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.stdout)
        .bind(&record.stderr)
        .bind(record.exit_code.map(i64::from))
        .bind(record.started_at.as_ref().map(timestamp))
        .bind(record.completed_at.as_ref().map(timestamp))
        .bind(record.memory_usage)
        .bind(record.cpu_time)
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the row is gone or it already reached a terminal state
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM executions WHERE id = ?")
                .bind(record.id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => StorageError::ExecutionTerminal(record.id),
                None => StorageError::ExecutionNotFound(record.id),
            });
        }
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?");
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StorageError::ExecutionNotFound(id))?.try_into()
    }

    async fn list_executions(&self, project_id: ProjectId) -> StorageResult<Vec<ExecutionRecord>> {
        let sql =
            format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE project_id = ? ORDER BY seq");
        let rows: Vec<ExecutionRow> = sqlx::query_as(&sql)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn list_unfinished_executions(&self) -> StorageResult<Vec<ExecutionRecord>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE status IN ('QUEUED', 'RUNNING') ORDER BY seq"
        );
        let rows: Vec<ExecutionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn create_environment(&self, project_id: ProjectId) -> StorageResult<EnvironmentRecord> {
        if !self.project_exists(project_id).await? {
            return Err(StorageError::ProjectNotFound(project_id));
        }

        let record = EnvironmentRecord {
            id: Uuid::new_v4(),
            project_id,
            created_at: Utc::now(),
            released_at: None,
        };

        sqlx::query("INSERT INTO environments (id, project_id, created_at) VALUES (?, ?, ?)")
            .bind(record.id.to_string())
            .bind(project_id.to_string())
            .bind(timestamp(&record.created_at))
            .execute(&self.pool)
            .await?;

        Ok(record)
    }

    async fn release_environment(&self, id: EnvironmentId) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE environments SET released_at = COALESCE(released_at, ?) WHERE id = ?",
        )
        .bind(timestamp(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EnvironmentNotFound(id));
        }
        Ok(())
    }
}
