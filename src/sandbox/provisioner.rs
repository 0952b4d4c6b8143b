use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProvisionError;
use crate::models::{EnvironmentRecord, File, Language};

use super::EnvironmentHandle;

/// Creates and destroys isolated sandboxes
///
/// Every call to `provision` yields a fresh filesystem populated from the given
/// file snapshot, so nothing written by one execution is visible to the next.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Builds a sandbox for the environment `env` running `language`
    ///
    /// `files` is the point-in-time snapshot of the project; later edits to the
    /// project never reach the sandbox.
    async fn provision(
        &self,
        env: &EnvironmentRecord,
        language: Language,
        files: &[File],
    ) -> Result<Arc<EnvironmentHandle>, ProvisionError>;

    /// Releases every resource held by the sandbox
    ///
    /// Idempotent. Stray processes are killed and the filesystem is removed
    /// even if the execution crashed halfway; failures are logged and returned.
    async fn teardown(&self, handle: &EnvironmentHandle) -> Result<(), ProvisionError>;
}
