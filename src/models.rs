use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProjectId = Uuid;
pub type FileId = Uuid;
pub type ExecutionId = Uuid;
pub type EnvironmentId = Uuid;

/// Languages a project can be written in
///
/// The set is closed: a project's language is fixed for its lifetime because
/// sandboxes are provisioned per language.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Ruby,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Javascript, Language::Ruby];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Ruby => "ruby",
        }
    }

    /// Entry file used when a submission does not name one
    pub fn default_entry(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Javascript => "index.js",
            Self::Ruby => "main.rb",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unsupported language: {s}"))
    }
}

/// Lifecycle of an execution
///
/// ```text
/// QUEUED -> RUNNING -> COMPLETED | ERROR
/// QUEUED -> ERROR              (cancelled before start)
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Error) | (Running, Completed) | (Running, Error)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub language: Language,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub language: Language,
    pub owner_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct File {
    pub id: FileId,
    pub project_id: ProjectId,
    pub path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewFile {
    pub project_id: ProjectId,
    pub path: String,
    pub content: String,
}

/// Audit row written for every sandbox the provisioner creates
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentRecord {
    pub id: EnvironmentId,
    pub project_id: ProjectId,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Persisted state of one execution
///
/// `memory_usage` is peak resident memory in MB and `cpu_time` is seconds;
/// both stay `None` until the record is terminal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub project_id: ProjectId,
    pub entry_file: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub memory_usage: Option<f64>,
    pub cpu_time: Option<f64>,
}

/// What callers of `get_status` observe
pub type ExecutionSnapshot = ExecutionRecord;

impl ExecutionRecord {
    pub fn queued(project_id: ProjectId, entry_file: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            entry_file,
            status: ExecutionStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            memory_usage: None,
            cpu_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Why a run was cancelled
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Operator,
    ProjectDeleted,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => f.write_str("cancelled by request"),
            Self::ProjectDeleted => f.write_str("owning project was deleted"),
            Self::Shutdown => f.write_str("engine shutting down"),
        }
    }
}

/// Checks a project-relative file path
///
/// Returns the normalized path (no leading `./`, no empty segments) or `None`
/// when the path is empty, absolute, or escapes the project root.
pub fn normalize_file_path(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return None;
    }

    let mut parts = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Error));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn test_status_parsing_is_strict() {
        assert_eq!("RUNNING".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Running));
        assert!("running".parse::<ExecutionStatus>().is_err());
        assert!("Finished".parse::<ExecutionStatus>().is_err());

        let json = serde_json::to_string(&ExecutionStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }

    #[test]
    fn test_language_round_trip() {
        for language in Language::ALL {
            assert_eq!(language.as_str().parse::<Language>(), Ok(language));
        }
        assert!("cobol".parse::<Language>().is_err());
        assert_eq!(
            serde_json::from_str::<Language>("\"javascript\"").unwrap(),
            Language::Javascript
        );
    }

    #[test]
    fn test_normalize_file_path() {
        assert_eq!(normalize_file_path("main.py").as_deref(), Some("main.py"));
        assert_eq!(normalize_file_path("./src//lib.py").as_deref(), Some("src/lib.py"));
        assert_eq!(normalize_file_path("  "), None);
        assert_eq!(normalize_file_path("/etc/passwd"), None);
        assert_eq!(normalize_file_path("../outside.py"), None);
        assert_eq!(normalize_file_path("a/../../b"), None);
        assert_eq!(normalize_file_path("."), None);
    }

    #[test]
    fn test_new_record_is_queued() {
        let record = ExecutionRecord::queued(Uuid::new_v4(), "main.py".to_string());
        assert_eq!(record.status, ExecutionStatus::Queued);
        assert!(record.started_at.is_none());
        assert!(record.exit_code.is_none());
        assert!(!record.is_terminal());
    }
}
