use crate::error::Result;
use crate::types::{DataResource, FileTransfer, TransferStatus};
use async_trait::async_trait;
use std::any::Any;
use std::path::Path;
use uuid::Uuid;

/// A storage system capable of holding and transferring files.
///
/// One instance exists per configured endpoint. Implementations may move
/// bytes in-process (local copies, S3 puts) or orchestrate a remote service
/// (Globus); either way a transfer is asynchronous and identified by an
/// opaque handle that remains valid until the transfer reaches a terminal
/// status.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Name of the storage provider backing this endpoint
    fn provider(&self) -> &str;

    /// Root path against which relative resource paths are resolved
    fn root(&self) -> &Path;

    /// True iff every resource path is present and readable at this endpoint
    async fn files_staged(&self, resources: &[DataResource]) -> Result<bool>;

    /// Begin an asynchronous multi-file transfer to `destination` and return
    /// its handle. Fails with `DtsError::IncompatibleDestination` when the
    /// destination's concrete type cannot be served by this endpoint.
    async fn transfer(
        &self,
        destination: &dyn Endpoint,
        files: &[FileTransfer],
    ) -> Result<Uuid>;

    /// Non-blocking status query. Unrecognized handles fail with
    /// `DtsError::UnknownTransfer`.
    async fn status(&self, handle: Uuid) -> Result<TransferStatus>;

    /// Request cancellation of a transfer. Returns promptly even while
    /// cancellation is still propagating.
    async fn cancel(&self, handle: Uuid) -> Result<()>;

    /// Handles of all transfers that have not yet reached a terminal status
    async fn transfers(&self) -> Result<Vec<Uuid>>;

    /// Concrete-type access for destination compatibility checks
    fn as_any(&self) -> &dyn Any;
}
