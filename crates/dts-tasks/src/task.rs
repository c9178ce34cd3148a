use crate::manifest;
use chrono::{DateTime, Utc};
use dts_core::{
    DataResource, Database, DtsError, Endpoint, FileTransfer, Registry, Result, TransferStatus,
    TransferStatusCode,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Everything a task needs to observe and drive its sub-operations
pub struct EngineContext {
    pub registry: Arc<Registry>,
    /// Endpoint holding manifests between construction and delivery
    pub local_endpoint: Arc<dyn Endpoint>,
    /// Upper bound for any single endpoint/database call, at most the poll
    /// interval so one slow backend cannot monopolize the supervisor
    pub call_timeout: Duration,
}

/// One transfer request, from creation to its terminal status.
///
/// At most one of `staging`, `payload_transfer` and `manifest_transfer` is
/// present between supervisor ticks; `resources` is set exactly once when
/// staging is initiated; `completion_time` is set exactly once on entering a
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub orcid: String,
    pub source: String,
    pub destination: String,
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub resources: Option<Vec<DataResource>>,
    #[serde(default)]
    pub staging: Option<Uuid>,
    #[serde(default)]
    pub payload_transfer: Option<Uuid>,
    #[serde(default)]
    pub manifest_transfer: Option<Uuid>,
    #[serde(default)]
    pub manifest_file: Option<PathBuf>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub status: TransferStatus,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TransferTask {
    pub fn new(
        orcid: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        file_ids: Vec<String>,
    ) -> Self {
        let status = TransferStatus {
            code: TransferStatusCode::Staging,
            num_files: file_ids.len(),
            ..Default::default()
        };
        Self {
            id: Uuid::new_v4(),
            orcid: orcid.into(),
            source: source.into(),
            destination: destination.into(),
            file_ids,
            resources: None,
            staging: None,
            payload_transfer: None,
            manifest_transfer: None,
            manifest_file: None,
            canceled: false,
            status,
            completion_time: None,
        }
    }

    /// Destination folder for this task's files and manifest
    pub fn subfolder(&self) -> String {
        format!("dts-{}", self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `Failed`, clearing every sub-operation handle
    pub fn fail(&mut self, message: impl Into<String>) {
        self.staging = None;
        self.payload_transfer = None;
        self.manifest_transfer = None;
        self.status.code = TransferStatusCode::Failed;
        self.status.message = Some(message.into());
        self.completion_time = Some(Utc::now());
    }

    /// Advance the task by one observation. Exactly one of the four phase
    /// routines runs, chosen by which sub-operation handle is present.
    /// Transient endpoint errors are returned and leave the task unchanged;
    /// fatal conditions transition the task to `Failed` and return Ok.
    pub async fn update(&mut self, ctx: &EngineContext) -> Result<()> {
        if self.resources.is_none() {
            self.start(ctx).await
        } else if self.staging.is_some() {
            self.check_staging(ctx).await
        } else if self.payload_transfer.is_some() {
            self.check_transfer(ctx).await
        } else if self.manifest_transfer.is_some() {
            self.check_manifest(ctx).await
        } else {
            Ok(())
        }
    }

    /// Resolve resources on the source database and initiate staging. Both
    /// fields are committed together so a failed staging submission leaves
    /// the task untouched and retried on the next tick.
    async fn start(&mut self, ctx: &EngineContext) -> Result<()> {
        let Some(database) = self.source_database(ctx) else {
            return Ok(());
        };

        let resources = match bounded(ctx.call_timeout, database.resources(&self.file_ids)).await
        {
            Ok(resources) => resources,
            Err(DtsError::Timeout) => return Err(DtsError::Timeout),
            Err(e) => {
                self.fail(format!("resource resolution failed: {e}"));
                return Ok(());
            }
        };

        if resources.is_empty() || resources.len() != self.file_ids.len() {
            self.fail(format!(
                "resource resolution failed: {} of {} file ids resolved on {}",
                resources.len(),
                self.file_ids.len(),
                self.source
            ));
            return Ok(());
        }

        let handle = bounded(
            ctx.call_timeout,
            database.stage_files(&self.orcid, &self.file_ids),
        )
        .await?;

        self.resources = Some(resources);
        self.staging = Some(handle);
        self.status.code = TransferStatusCode::Staging;
        Ok(())
    }

    /// Once the source endpoint reports the files staged, start the payload
    /// transfer toward the destination endpoint
    async fn check_staging(&mut self, ctx: &EngineContext) -> Result<()> {
        let Some(database) = self.source_database(ctx) else {
            return Ok(());
        };
        let resources = self.resources.clone().unwrap_or_default();

        let staged = bounded(
            ctx.call_timeout,
            database.endpoint().files_staged(&resources),
        )
        .await?;
        if !staged {
            return Ok(());
        }

        let local_user = match self.resolve_local_user(ctx, &database).await {
            Ok(Some(user)) => user,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(destination) = self.destination_endpoint(ctx) else {
            return Ok(());
        };

        let folder = self.subfolder();
        let files: Vec<FileTransfer> = resources
            .iter()
            .map(|resource| {
                let mut transfer = FileTransfer::new(
                    resource.path.clone(),
                    format!("{local_user}/{folder}/{}", resource.path),
                );
                if !resource.hash.is_empty() {
                    transfer.hash = Some(resource.hash.clone());
                    transfer.hash_algorithm = resource.hash_algorithm.clone();
                }
                transfer
            })
            .collect();

        match bounded(
            ctx.call_timeout,
            database.endpoint().transfer(destination.as_ref(), &files),
        )
        .await
        {
            Ok(handle) => {
                self.payload_transfer = Some(handle);
                self.staging = None;
                self.status.code = TransferStatusCode::Active;
                Ok(())
            }
            Err(e @ DtsError::IncompatibleDestination(_)) => {
                self.fail(e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Observe the payload transfer; on success construct the manifest and
    /// hand it to the local endpoint for delivery
    async fn check_transfer(&mut self, ctx: &EngineContext) -> Result<()> {
        let Some(handle) = self.payload_transfer else {
            return Ok(());
        };
        let Some(database) = self.source_database(ctx) else {
            return Ok(());
        };

        let observed = match bounded(ctx.call_timeout, database.endpoint().status(handle)).await {
            Ok(observed) => observed,
            Err(DtsError::Timeout) => return Err(DtsError::Timeout),
            Err(DtsError::UnknownTransfer(_)) => {
                self.fail(format!(
                    "resume failed: source endpoint no longer recognizes transfer {handle}"
                ));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.status.num_files_transferred = observed.num_files_transferred;
        self.status.num_files_skipped = observed.num_files_skipped;

        match observed.code {
            TransferStatusCode::Failed => {
                self.payload_transfer = None;
                self.status.code = TransferStatusCode::Failed;
                self.status.message = observed
                    .message
                    .or_else(|| Some("payload transfer failed".into()));
                self.completion_time = Some(Utc::now());
                Ok(())
            }
            TransferStatusCode::Succeeded => self.begin_finalize(ctx, &database).await,
            TransferStatusCode::Inactive => {
                self.status.code = TransferStatusCode::Inactive;
                Ok(())
            }
            _ => {
                self.status.code = TransferStatusCode::Active;
                Ok(())
            }
        }
    }

    async fn begin_finalize(
        &mut self,
        ctx: &EngineContext,
        database: &Arc<dyn Database>,
    ) -> Result<()> {
        let resources = self.resources.clone().unwrap_or_default();
        let manifest_path = manifest::write_manifest(ctx.local_endpoint.root(), &resources)?;

        let local_user = match self.resolve_local_user(ctx, database).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                // The task was already failed; drop the just-written manifest
                remove_manifest(&manifest_path);
                return Ok(());
            }
            Err(e) => {
                remove_manifest(&manifest_path);
                return Err(e);
            }
        };
        let Some(destination) = self.destination_endpoint(ctx) else {
            remove_manifest(&manifest_path);
            return Ok(());
        };

        let basename = manifest_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let delivery = FileTransfer::new(
            basename,
            format!("{local_user}/{}/manifest.json", self.subfolder()),
        );

        match bounded(
            ctx.call_timeout,
            ctx.local_endpoint
                .transfer(destination.as_ref(), std::slice::from_ref(&delivery)),
        )
        .await
        {
            Ok(handle) => {
                self.manifest_file = Some(manifest_path);
                self.manifest_transfer = Some(handle);
                self.payload_transfer = None;
                self.status.code = TransferStatusCode::Finalizing;
                Ok(())
            }
            Err(e @ DtsError::IncompatibleDestination(_)) => {
                remove_manifest(&manifest_path);
                self.fail(e.to_string());
                Ok(())
            }
            Err(e) => {
                remove_manifest(&manifest_path);
                Err(e)
            }
        }
    }

    /// Observe the manifest delivery; any terminal code completes the task
    async fn check_manifest(&mut self, ctx: &EngineContext) -> Result<()> {
        let Some(handle) = self.manifest_transfer else {
            return Ok(());
        };

        let observed = match bounded(ctx.call_timeout, ctx.local_endpoint.status(handle)).await {
            Ok(observed) => observed,
            Err(DtsError::Timeout) => return Err(DtsError::Timeout),
            Err(DtsError::UnknownTransfer(_)) => {
                if let Some(path) = self.manifest_file.take() {
                    remove_manifest(&path);
                }
                self.fail(format!(
                    "resume failed: local endpoint no longer recognizes transfer {handle}"
                ));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !observed.code.is_terminal() {
            return Ok(());
        }

        if let Some(path) = self.manifest_file.take() {
            remove_manifest(&path);
        }
        self.manifest_transfer = None;
        self.status.code = observed.code;
        if observed.code == TransferStatusCode::Failed {
            self.status.message = observed
                .message
                .or_else(|| Some("manifest transfer failed".into()));
        }
        self.completion_time = Some(Utc::now());
        Ok(())
    }

    /// Look up the source database, failing the task when the configuration
    /// no longer knows it (a checkpoint can outlive a database)
    fn source_database(&mut self, ctx: &EngineContext) -> Option<Arc<dyn Database>> {
        match ctx.registry.database(&self.source) {
            Ok(database) => Some(database),
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    fn destination_endpoint(&mut self, ctx: &EngineContext) -> Option<Arc<dyn Endpoint>> {
        match ctx.registry.database(&self.destination) {
            Ok(database) => Some(database.endpoint()),
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    /// `Ok(None)` means the task was failed here (unmappable user);
    /// transient errors bubble out for retry
    async fn resolve_local_user(
        &mut self,
        ctx: &EngineContext,
        database: &Arc<dyn Database>,
    ) -> Result<Option<String>> {
        match bounded(ctx.call_timeout, database.local_user(&self.orcid)).await {
            Ok(user) => Ok(Some(user)),
            Err(DtsError::Timeout) => Err(DtsError::Timeout),
            Err(e @ DtsError::Federation(_)) => {
                self.fail(e.to_string());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn remove_manifest(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Cannot remove manifest {}: {}", path.display(), e);
    }
}

/// Impose the per-call timeout on an endpoint or database operation
async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(DtsError::Timeout),
    }
}
