use crate::tracker::TransferTracker;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use dts_core::{
    CredentialConfig, DataResource, DtsError, Endpoint, EndpointConfig, FileTransfer, Result,
    TransferStatus, TransferStatusCode,
};
use std::any::Any;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use uuid::Uuid;

/// An endpoint backed by one bucket in an S3-compatible object store.
///
/// Object keys are the resource paths; transfers to another S3 endpoint are
/// server-side `CopyObject` calls driven by a spawned worker, so no payload
/// bytes pass through the service.
pub struct S3Endpoint {
    name: String,
    bucket: String,
    root: PathBuf,
    client: Client,
    tracker: TransferTracker,
}

impl S3Endpoint {
    pub async fn new(
        name: &str,
        config: &EndpointConfig,
        credential: Option<&CredentialConfig>,
    ) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| DtsError::Config(format!("s3 endpoint '{name}' requires a bucket")))?;

        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(credential) = credential {
            builder = builder.credentials_provider(Credentials::new(
                credential.id.clone(),
                credential.secret.clone(),
                None,
                None,
                "dts-config",
            ));
        }
        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some(url) = &config.url {
            // S3-compatible stores are usually addressed path-style
            builder = builder.endpoint_url(url).force_path_style(true);
        }

        Ok(Self {
            name: name.to_string(),
            bucket,
            root: PathBuf::from("/"),
            client: Client::from_conf(builder.build()),
            tracker: TransferTracker::new(),
        })
    }

    /// Provider-specific access for components that talk to the bucket
    /// directly (the S3 database, local-to-S3 uploads)
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(DtsError::Transfer(format!(
                        "head s3://{}/{key}: {service_error}",
                        self.bucket
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl Endpoint for S3Endpoint {
    fn provider(&self) -> &str {
        "s3"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn files_staged(&self, resources: &[DataResource]) -> Result<bool> {
        for resource in resources {
            if !self.object_exists(&resource.path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn transfer(
        &self,
        destination: &dyn Endpoint,
        files: &[FileTransfer],
    ) -> Result<Uuid> {
        let Some(dst) = destination.as_any().downcast_ref::<S3Endpoint>() else {
            return Err(DtsError::IncompatibleDestination(format!(
                "s3 endpoint '{}' cannot deliver to provider '{}'",
                self.name,
                destination.provider()
            )));
        };

        let handle = self.tracker.register(files.len()).await;
        debug!(
            "S3 transfer {}: {} file(s) s3://{} -> s3://{}",
            handle,
            files.len(),
            self.bucket,
            dst.bucket
        );

        let tracker = self.tracker.clone();
        let client = self.client.clone();
        let source_bucket = self.bucket.clone();
        let destination_bucket = dst.bucket.clone();
        let files = files.to_vec();
        tokio::spawn(async move {
            copy_worker(
                tracker,
                handle,
                client,
                source_bucket,
                destination_bucket,
                files,
            )
            .await;
        });
        Ok(handle)
    }

    async fn status(&self, handle: Uuid) -> Result<TransferStatus> {
        self.tracker.status(handle).await
    }

    async fn cancel(&self, handle: Uuid) -> Result<()> {
        self.tracker.cancel(handle).await
    }

    async fn transfers(&self) -> Result<Vec<Uuid>> {
        Ok(self.tracker.active_handles().await)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Server-side bucket-to-bucket copies. Missing source keys count as
/// skipped, matching the local endpoint's policy.
async fn copy_worker(
    tracker: TransferTracker,
    handle: Uuid,
    client: Client,
    source_bucket: String,
    destination_bucket: String,
    files: Vec<FileTransfer>,
) {
    for file in &files {
        if tracker.is_canceled(handle).await {
            tracker
                .update(handle, |status| {
                    status.code = TransferStatusCode::Failed;
                    status.message = Some("transfer canceled".into());
                    // Files never attempted are reported as skipped
                    status.num_files_skipped = status.num_files - status.num_files_transferred;
                })
                .await;
            return;
        }

        let exists = client
            .head_object()
            .bucket(&source_bucket)
            .key(&file.source_path)
            .send()
            .await;
        if let Err(e) = exists {
            let service_error = e.into_service_error();
            if service_error.is_not_found() {
                debug!(
                    "Transfer {}: s3://{}/{} missing, skipping",
                    handle, source_bucket, file.source_path
                );
                tracker
                    .update(handle, |status| status.num_files_skipped += 1)
                    .await;
                continue;
            }
            fail(
                &tracker,
                handle,
                format!(
                    "head s3://{source_bucket}/{}: {service_error}",
                    file.source_path
                ),
            )
            .await;
            return;
        }

        let result = client
            .copy_object()
            .copy_source(format!("{source_bucket}/{}", file.source_path))
            .bucket(&destination_bucket)
            .key(&file.destination_path)
            .send()
            .await;
        if let Err(e) = result {
            fail(
                &tracker,
                handle,
                format!(
                    "copy s3://{source_bucket}/{} -> s3://{destination_bucket}/{}: {e}",
                    file.source_path, file.destination_path
                ),
            )
            .await;
            return;
        }
        tracker
            .update(handle, |status| status.num_files_transferred += 1)
            .await;
    }

    tracker
        .update(handle, |status| status.code = TransferStatusCode::Succeeded)
        .await;
}

async fn fail(tracker: &TransferTracker, handle: Uuid, message: String) {
    error!("Transfer {} failed: {}", handle, message);
    tracker
        .update(handle, |status| {
            status.code = TransferStatusCode::Failed;
            status.message = Some(message);
        })
        .await;
}
