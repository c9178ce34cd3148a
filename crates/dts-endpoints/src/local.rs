use crate::s3::S3Endpoint;
use crate::tracker::TransferTracker;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use dts_core::{
    DataResource, DtsError, Endpoint, FileTransfer, Result, TransferStatus, TransferStatusCode,
};
use std::any::Any;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use uuid::Uuid;

/// An endpoint backed by a directory on the local filesystem.
///
/// Transfers are driven by a spawned worker per request: local destinations
/// are plain file copies, S3 destinations are streamed uploads (which is how
/// a manifest staged on disk reaches an object store).
pub struct LocalEndpoint {
    name: String,
    root: PathBuf,
    tracker: TransferTracker,
}

impl LocalEndpoint {
    pub fn new(name: impl Into<String>, root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.into(),
            root,
            tracker: TransferTracker::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn provider(&self) -> &str {
        "local"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn files_staged(&self, resources: &[DataResource]) -> Result<bool> {
        for resource in resources {
            if tokio::fs::metadata(self.root.join(&resource.path)).await.is_err() {
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
        let handle = self.tracker.register(files.len()).await;
        let tracker = self.tracker.clone();
        let source_root = self.root.clone();
        let files = files.to_vec();

        if let Some(dst) = destination.as_any().downcast_ref::<LocalEndpoint>() {
            let destination_root = dst.root.clone();
            debug!(
                "Local transfer {}: {} file(s) {} -> {}",
                handle,
                files.len(),
                source_root.display(),
                destination_root.display()
            );
            tokio::spawn(async move {
                copy_worker(tracker, handle, source_root, destination_root, files).await;
            });
            Ok(handle)
        } else if let Some(dst) = destination.as_any().downcast_ref::<S3Endpoint>() {
            let client = dst.client().clone();
            let bucket = dst.bucket().to_string();
            debug!(
                "Local transfer {}: {} file(s) {} -> s3://{}",
                handle,
                files.len(),
                source_root.display(),
                bucket
            );
            tokio::spawn(async move {
                upload_worker(tracker, handle, source_root, client, bucket, files).await;
            });
            Ok(handle)
        } else {
            Err(DtsError::IncompatibleDestination(format!(
                "local endpoint '{}' cannot deliver to provider '{}'",
                self.name,
                destination.provider()
            )))
        }
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

/// Copy files into another local root. Missing sources count as skipped;
/// any other io error fails the whole transfer.
async fn copy_worker(
    tracker: TransferTracker,
    handle: Uuid,
    source_root: PathBuf,
    destination_root: PathBuf,
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

        let source = source_root.join(&file.source_path);
        match tokio::fs::metadata(&source).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Transfer {}: source {} missing, skipping", handle, file.source_path);
                tracker
                    .update(handle, |status| status.num_files_skipped += 1)
                    .await;
                continue;
            }
            Err(e) => {
                fail(&tracker, handle, format!("stat {}: {e}", file.source_path)).await;
                return;
            }
            Ok(_) => {}
        }

        let destination = destination_root.join(&file.destination_path);
        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                fail(&tracker, handle, format!("mkdir {}: {e}", parent.display())).await;
                return;
            }
        }
        if let Err(e) = tokio::fs::copy(&source, &destination).await {
            fail(&tracker, handle, format!("copy {}: {e}", file.source_path)).await;
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

/// Upload files into an S3 bucket. Same skip/fail policy as `copy_worker`.
async fn upload_worker(
    tracker: TransferTracker,
    handle: Uuid,
    source_root: PathBuf,
    client: aws_sdk_s3::Client,
    bucket: String,
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

        let source = source_root.join(&file.source_path);
        let body = match ByteStream::from_path(&source).await {
            Ok(body) => body,
            Err(_) if !source.exists() => {
                tracker
                    .update(handle, |status| status.num_files_skipped += 1)
                    .await;
                continue;
            }
            Err(e) => {
                fail(&tracker, handle, format!("read {}: {e}", file.source_path)).await;
                return;
            }
        };

        let result = client
            .put_object()
            .bucket(&bucket)
            .key(&file.destination_path)
            .body(body)
            .send()
            .await;
        if let Err(e) = result {
            fail(
                &tracker,
                handle,
                format!("put s3://{bucket}/{}: {e}", file.destination_path),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_terminal(endpoint: &LocalEndpoint, handle: Uuid) -> TransferStatus {
        for _ in 0..500 {
            let status = endpoint.status(handle).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer {handle} did not reach a terminal status");
    }

    #[tokio::test]
    async fn test_copy_between_local_endpoints() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        std::fs::write(src_dir.path().join("file1.txt"), b"alpha").unwrap();
        std::fs::write(src_dir.path().join("file2.txt"), b"beta").unwrap();

        let src = LocalEndpoint::new("src", src_dir.path().to_path_buf()).unwrap();
        let dst = LocalEndpoint::new("dst", dst_dir.path().to_path_buf()).unwrap();

        let files = vec![
            FileTransfer::new("file1.txt", "user/dts-1/file1.txt"),
            FileTransfer::new("file2.txt", "user/dts-1/file2.txt"),
        ];
        let handle = src.transfer(&dst, &files).await.unwrap();

        let status = wait_terminal(&src, handle).await;
        assert_eq!(status.code, TransferStatusCode::Succeeded);
        assert_eq!(status.num_files_transferred, 2);
        assert_eq!(status.num_files_skipped, 0);

        let copied = std::fs::read(dst_dir.path().join("user/dts-1/file1.txt")).unwrap();
        assert_eq!(copied, b"alpha");
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        std::fs::write(src_dir.path().join("file1.txt"), b"alpha").unwrap();

        let src = LocalEndpoint::new("src", src_dir.path().to_path_buf()).unwrap();
        let dst = LocalEndpoint::new("dst", dst_dir.path().to_path_buf()).unwrap();

        let files = vec![
            FileTransfer::new("nonexistent.txt", "user/dts-2/nonexistent.txt"),
            FileTransfer::new("file1.txt", "user/dts-2/file1.txt"),
        ];
        let handle = src.transfer(&dst, &files).await.unwrap();

        let status = wait_terminal(&src, handle).await;
        assert_eq!(status.code, TransferStatusCode::Succeeded);
        assert_eq!(status.num_files_transferred, 1);
        assert_eq!(status.num_files_skipped, 1);
        assert!(!dst_dir.path().join("user/dts-2/nonexistent.txt").exists());
    }

    #[tokio::test]
    async fn test_cancel_before_worker_runs() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        std::fs::write(src_dir.path().join("file1.txt"), b"alpha").unwrap();

        let src = LocalEndpoint::new("src", src_dir.path().to_path_buf()).unwrap();
        let dst = LocalEndpoint::new("dst", dst_dir.path().to_path_buf()).unwrap();

        let files = vec![FileTransfer::new("file1.txt", "user/dts-3/file1.txt")];
        // Single-threaded test runtime: the worker has not run yet when we
        // cancel, so it must observe the flag before copying anything.
        let handle = src.transfer(&dst, &files).await.unwrap();
        src.cancel(handle).await.unwrap();

        let status = wait_terminal(&src, handle).await;
        assert_eq!(status.code, TransferStatusCode::Failed);
        assert_eq!(status.num_files_transferred, 0);
    }

    #[tokio::test]
    async fn test_unknown_handle_rejected() {
        let dir = TempDir::new().unwrap();
        let endpoint = LocalEndpoint::new("src", dir.path().to_path_buf()).unwrap();

        let err = endpoint.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DtsError::UnknownTransfer(_)));
    }

    #[tokio::test]
    async fn test_files_staged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("present.txt"), b"here").unwrap();
        let endpoint = LocalEndpoint::new("src", dir.path().to_path_buf()).unwrap();

        let present = DataResource {
            id: "present.txt".into(),
            name: "present".into(),
            path: "present.txt".into(),
            format: None,
            media_type: None,
            bytes: 4,
            hash: String::new(),
            hash_algorithm: None,
            sources: None,
            licenses: None,
            credit: None,
            metadata: None,
        };
        assert!(endpoint.files_staged(std::slice::from_ref(&present)).await.unwrap());

        let mut missing = present.clone();
        missing.path = "absent.txt".into();
        assert!(!endpoint.files_staged(&[present, missing]).await.unwrap());
    }

    #[tokio::test]
    async fn test_transfers_lists_only_active() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        std::fs::write(src_dir.path().join("file1.txt"), b"alpha").unwrap();

        let src = LocalEndpoint::new("src", src_dir.path().to_path_buf()).unwrap();
        let dst = LocalEndpoint::new("dst", dst_dir.path().to_path_buf()).unwrap();

        let handle = src
            .transfer(&dst, &[FileTransfer::new("file1.txt", "out/file1.txt")])
            .await
            .unwrap();
        wait_terminal(&src, handle).await;
        assert!(src.transfers().await.unwrap().is_empty());
    }
}
