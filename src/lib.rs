pub mod config;
pub mod database;
pub mod error;
pub mod lease;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use error::{EngineError, ExecutionFailure, ProvisionError, RunnerError, StorageError};
pub use models::{ExecutionRecord, ExecutionStatus, Language};
pub use scheduler::Scheduler;
pub use storage::{MemoryStorage, Storage};
