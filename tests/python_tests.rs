//! End-to-end runs through a real `python3`; skipped when it is not installed.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use rexec::config::{EngineConfig, LanguageConfig, SandboxConfig};
use rexec::models::{ExecutionRecord, ExecutionStatus, Language, NewFile, NewProject};
use rexec::monitor::ResourceMonitor;
use rexec::runner::Runner;
use rexec::sandbox::{DirectoryProvisioner, find_in_path};
use rexec::{MemoryStorage, Scheduler, Storage};

async fn run_python(source: &str) -> Option<ExecutionRecord> {
    if find_in_path("python3").is_none() {
        eprintln!("python3 not found, skipping");
        return None;
    }

    let root = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let provisioner = DirectoryProvisioner::build(
        root.path().to_path_buf(),
        SandboxConfig::default(),
        LanguageConfig::default(),
    )
    .unwrap();
    let config = EngineConfig::default();
    let runner = Runner::new(
        config.grace_period_ms.into(),
        ResourceMonitor::procfs(config.sample_interval_ms.into()),
    );
    let scheduler = Scheduler::new(storage.clone(), Arc::new(provisioner), runner, config);
    scheduler.start();

    let project = storage
        .create_project(NewProject {
            name: "py".to_string(),
            description: None,
            language: Language::Python,
            owner_id: "tester".to_string(),
        })
        .await
        .unwrap();
    storage
        .save_file(NewFile {
            project_id: project.id,
            path: "main.py".to_string(),
            content: source.to_string(),
        })
        .await
        .unwrap();

    let id = scheduler.submit(project.id, None).await.unwrap();
    let record = tokio::time::timeout(Duration::from_secs(20), scheduler.wait(id))
        .await
        .unwrap()
        .unwrap();
    scheduler.shutdown().await;
    Some(record)
}

#[tokio::test]
async fn test_print_hi() {
    let Some(record) = run_python("print(\"hi\")\n").await else {
        return;
    };
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.stdout, "hi\n");
    assert_eq!(record.stderr, "");
    assert_eq!(record.exit_code, Some(0));
}

#[tokio::test]
async fn test_sys_exit_code() {
    let Some(record) = run_python("import sys; sys.exit(3)\n").await else {
        return;
    };
    assert_eq!(record.status, ExecutionStatus::Error);
    assert_eq!(record.exit_code, Some(3));
}

#[tokio::test]
async fn test_uncaught_exception_lands_in_stderr() {
    let Some(record) = run_python("raise ValueError('boom')\n").await else {
        return;
    };
    assert_eq!(record.status, ExecutionStatus::Error);
    assert_eq!(record.exit_code, Some(1));
    assert!(record.stderr.contains("ValueError: boom"));
}
