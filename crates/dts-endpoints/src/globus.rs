use async_trait::async_trait;
use dts_core::{
    CredentialConfig, DataResource, DtsError, Endpoint, EndpointConfig, FileTransfer, Result,
    TransferStatus, TransferStatusCode,
};
use serde::Deserialize;
use std::any::Any;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_TRANSFER_API: &str = "https://transfer.api.globus.org/v0.10";

/// An endpoint backed by a Globus collection.
///
/// Transfers are remote-orchestrated: DTS submits a transfer document to the
/// Globus Transfer API and the returned Globus task id becomes the handle;
/// all byte movement happens between the collections themselves.
pub struct GlobusEndpoint {
    name: String,
    endpoint_id: Uuid,
    base_url: String,
    root: PathBuf,
    token: String,
    http: reqwest::Client,
}

/// Directory-entry metadata reported by a Globus collection
#[derive(Debug, Clone, Deserialize)]
pub struct GlobusFileInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Deserialize)]
struct SubmissionId {
    value: Uuid,
}

#[derive(Deserialize)]
struct TransferResult {
    task_id: Uuid,
}

#[derive(Deserialize)]
struct GlobusTask {
    status: String,
    #[serde(default)]
    files: usize,
    #[serde(default)]
    files_transferred: usize,
    #[serde(default)]
    files_skipped: usize,
    #[serde(default)]
    nice_status_short_description: Option<String>,
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(rename = "DATA", default)]
    data: Vec<TaskListEntry>,
}

#[derive(Deserialize)]
struct TaskListEntry {
    task_id: Uuid,
}

impl GlobusEndpoint {
    pub fn new(
        name: &str,
        config: &EndpointConfig,
        credential: Option<&CredentialConfig>,
    ) -> Result<Self> {
        let endpoint_id = config.id.ok_or_else(|| {
            DtsError::Config(format!("globus endpoint '{name}' requires a collection id"))
        })?;
        let credential = credential.ok_or_else(|| {
            DtsError::Config(format!("globus endpoint '{name}' requires a credential"))
        })?;

        Ok(Self {
            name: name.to_string(),
            endpoint_id,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_TRANSFER_API.to_string()),
            root: config.root.clone().unwrap_or_else(|| PathBuf::from("/")),
            token: credential.secret.clone(),
            http: reqwest::Client::new(),
        })
    }

    /// Absolute path of a root-relative resource path on the collection
    fn absolute(&self, relative: &str) -> String {
        self.root.join(relative).to_string_lossy().into_owned()
    }

    /// Stat one path on the collection; `None` when the path does not exist.
    /// Also used by the grid database to resolve resource descriptors.
    pub async fn stat(&self, relative: &str) -> Result<Option<GlobusFileInfo>> {
        let url = format!(
            "{}/operation/endpoint/{}/stat",
            self.base_url, self.endpoint_id
        );
        let response = self
            .http
            .get(url)
            .query(&[("path", self.absolute(relative))])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus stat: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "globus stat")?;
        let info = response
            .json::<GlobusFileInfo>()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus stat: {e}")))?;
        Ok(Some(info))
    }

    async fn submission_id(&self) -> Result<Uuid> {
        let url = format!("{}/submission_id", self.base_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus submission id: {e}")))?;
        let response = check(response, "globus submission id")?;
        let submission = response
            .json::<SubmissionId>()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus submission id: {e}")))?;
        Ok(submission.value)
    }
}

#[async_trait]
impl Endpoint for GlobusEndpoint {
    fn provider(&self) -> &str {
        "globus"
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn files_staged(&self, resources: &[DataResource]) -> Result<bool> {
        for resource in resources {
            if self.stat(&resource.path).await?.is_none() {
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
        let Some(dst) = destination.as_any().downcast_ref::<GlobusEndpoint>() else {
            return Err(DtsError::IncompatibleDestination(format!(
                "globus endpoint '{}' cannot deliver to provider '{}'",
                self.name,
                destination.provider()
            )));
        };

        let submission_id = self.submission_id().await?;
        let items: Vec<serde_json::Value> = files
            .iter()
            .map(|file| {
                serde_json::json!({
                    "DATA_TYPE": "transfer_item",
                    "source_path": self.absolute(&file.source_path),
                    "destination_path": dst.absolute(&file.destination_path),
                })
            })
            .collect();
        let document = serde_json::json!({
            "DATA_TYPE": "transfer",
            "submission_id": submission_id,
            "source_endpoint": self.endpoint_id,
            "destination_endpoint": dst.endpoint_id,
            "notify_on_succeeded": false,
            "notify_on_failed": false,
            "DATA": items,
        });

        let url = format!("{}/transfer", self.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&document)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus transfer submit: {e}")))?;
        let response = check(response, "globus transfer submit")?;
        let result = response
            .json::<TransferResult>()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus transfer submit: {e}")))?;

        debug!(
            "Globus transfer {}: {} item(s) {} -> {}",
            result.task_id,
            files.len(),
            self.endpoint_id,
            dst.endpoint_id
        );
        Ok(result.task_id)
    }

    async fn status(&self, handle: Uuid) -> Result<TransferStatus> {
        let url = format!("{}/task/{}", self.base_url, handle);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus task status: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DtsError::UnknownTransfer(handle));
        }
        let response = check(response, "globus task status")?;
        let task = response
            .json::<GlobusTask>()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus task status: {e}")))?;
        Ok(map_task_status(&task))
    }

    async fn cancel(&self, handle: Uuid) -> Result<()> {
        let url = format!("{}/task/{}/cancel", self.base_url, handle);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus task cancel: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DtsError::UnknownTransfer(handle));
        }
        check(response, "globus task cancel")?;
        Ok(())
    }

    async fn transfers(&self) -> Result<Vec<Uuid>> {
        let url = format!("{}/task_list", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[
                ("filter", "status:ACTIVE,INACTIVE"),
                ("fields", "task_id"),
                ("limit", "1000"),
            ])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus task list: {e}")))?;
        let response = check(response, "globus task list")?;
        let list = response
            .json::<TaskList>()
            .await
            .map_err(|e| DtsError::Transfer(format!("globus task list: {e}")))?;
        Ok(list.data.into_iter().map(|entry| entry.task_id).collect())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn check(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DtsError::Auth(format!("{context}: HTTP {status}")));
    }
    if !status.is_success() {
        return Err(DtsError::Transfer(format!("{context}: HTTP {status}")));
    }
    Ok(response)
}

/// Map the Globus task vocabulary (ACTIVE / INACTIVE / SUCCEEDED / FAILED)
/// onto transfer status codes
fn map_task_status(task: &GlobusTask) -> TransferStatus {
    let code = match task.status.as_str() {
        "ACTIVE" => TransferStatusCode::Active,
        "INACTIVE" => TransferStatusCode::Inactive,
        "SUCCEEDED" => TransferStatusCode::Succeeded,
        "FAILED" => TransferStatusCode::Failed,
        _ => TransferStatusCode::Unknown,
    };
    TransferStatus {
        code,
        message: task.nice_status_short_description.clone(),
        num_files: task.files,
        num_files_transferred: task.files_transferred,
        num_files_skipped: task.files_skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalEndpoint;
    use tempfile::TempDir;

    fn test_endpoint() -> GlobusEndpoint {
        let config = EndpointConfig {
            name: "Grid".into(),
            id: Some(Uuid::new_v4()),
            provider: "globus".into(),
            credential: Some("globus".into()),
            root: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        let credential = CredentialConfig {
            id: "client".into(),
            secret: "token".into(),
        };
        GlobusEndpoint::new("grid", &config, Some(&credential)).unwrap()
    }

    #[test]
    fn test_requires_collection_id() {
        let config = EndpointConfig {
            provider: "globus".into(),
            ..Default::default()
        };
        let credential = CredentialConfig::default();
        assert!(GlobusEndpoint::new("grid", &config, Some(&credential)).is_err());
    }

    #[test]
    fn test_absolute_paths() {
        let endpoint = test_endpoint();
        assert_eq!(endpoint.absolute("file1.txt"), "/data/file1.txt");
        assert_eq!(endpoint.absolute("sub/file2.txt"), "/data/sub/file2.txt");
    }

    #[test]
    fn test_task_status_mapping() {
        let task = GlobusTask {
            status: "SUCCEEDED".into(),
            files: 3,
            files_transferred: 2,
            files_skipped: 1,
            nice_status_short_description: None,
        };
        let status = map_task_status(&task);
        assert_eq!(status.code, TransferStatusCode::Succeeded);
        assert_eq!(status.num_files, 3);
        assert_eq!(status.num_files_transferred, 2);
        assert_eq!(status.num_files_skipped, 1);

        for (word, code) in [
            ("ACTIVE", TransferStatusCode::Active),
            ("INACTIVE", TransferStatusCode::Inactive),
            ("FAILED", TransferStatusCode::Failed),
            ("MYSTERY", TransferStatusCode::Unknown),
        ] {
            let task = GlobusTask {
                status: word.into(),
                files: 0,
                files_transferred: 0,
                files_skipped: 0,
                nice_status_short_description: None,
            };
            assert_eq!(map_task_status(&task).code, code);
        }
    }

    #[tokio::test]
    async fn test_incompatible_destinations() {
        let dir = TempDir::new().unwrap();
        let local = LocalEndpoint::new("disk", dir.path().to_path_buf()).unwrap();
        let globus = test_endpoint();
        let files = [FileTransfer::new("a", "b")];

        let err = globus.transfer(&local, &files).await.unwrap_err();
        assert!(matches!(err, DtsError::IncompatibleDestination(_)));

        let err = local.transfer(&globus, &files).await.unwrap_err();
        assert!(matches!(err, DtsError::IncompatibleDestination(_)));
    }
}
