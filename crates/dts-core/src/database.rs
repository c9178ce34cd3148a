use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::types::{DataResource, SearchParameters, TransferStatusCode};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// A logical collection of files addressable by id, bound to exactly one
/// endpoint.
#[async_trait]
pub trait Database: Send + Sync {
    /// Request that the named files be made readable on this database's
    /// endpoint, returning a staging handle. Staging is a no-op for backends
    /// whose files are always online; those return a fresh handle that is
    /// immediately complete.
    async fn stage_files(&self, orcid: &str, file_ids: &[String]) -> Result<Uuid>;

    /// Fast-path staging query. The task engine prefers
    /// `endpoint().files_staged`, which observes the storage directly.
    async fn staging_status(&self, handle: Uuid) -> Result<TransferStatusCode>;

    /// Resolve file ids to full resource descriptors. Ids that cannot be
    /// resolved are omitted from the result; callers compare counts.
    async fn resources(&self, file_ids: &[String]) -> Result<Vec<DataResource>>;

    /// The endpoint this database is bound to
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    /// Translate the caller's ORCID to a local user name on this database's
    /// endpoint
    async fn local_user(&self, orcid: &str) -> Result<String>;

    /// Search the database for files matching the given parameters
    async fn search(&self, params: &SearchParameters) -> Result<Vec<DataResource>>;

    /// Resolve descriptors for the HTTP by-id lookup; identical to
    /// `resources` unless a database exposes richer display metadata
    async fn descriptors(&self, file_ids: &[String]) -> Result<Vec<DataResource>> {
        self.resources(file_ids).await
    }

    /// Hook invoked by the HTTP layer when a transfer's payload has been
    /// delivered
    async fn finalize(&self, _orcid: &str, _task_id: Uuid) -> Result<()> {
        Ok(())
    }

    /// Serialize database-specific state for the service checkpoint
    async fn save(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Restore database-specific state from a service checkpoint
    async fn load(&self, _state: &[u8]) -> Result<()> {
        Ok(())
    }
}
