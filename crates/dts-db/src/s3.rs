use async_trait::async_trait;
use aws_sdk_s3::Client;
use dts_core::{
    DataResource, Database, DatabaseConfig, DtsError, Endpoint, Result, SearchParameters,
    TransferStatusCode,
};
use dts_endpoints::S3Endpoint;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A database whose files are the objects of an S3 bucket.
///
/// File ids are object keys. Objects are always online, so staging handles
/// complete instantly, and the local user is a configured constant (object
/// stores have no per-caller accounts to federate into).
pub struct S3Database {
    endpoint: Arc<dyn Endpoint>,
    client: Client,
    bucket: String,
    local_user: String,
    staging_handles: Mutex<HashSet<Uuid>>,
}

impl S3Database {
    pub fn new(name: &str, config: &DatabaseConfig, endpoint: Arc<dyn Endpoint>) -> Result<Self> {
        let s3 = endpoint
            .as_any()
            .downcast_ref::<S3Endpoint>()
            .ok_or_else(|| {
                DtsError::Config(format!(
                    "database '{name}' requires an s3 endpoint, got provider '{}'",
                    endpoint.provider()
                ))
            })?;
        let client = s3.client().clone();
        let bucket = s3.bucket().to_string();

        Ok(Self {
            endpoint,
            client,
            bucket,
            local_user: config.local_user.clone(),
            staging_handles: Mutex::new(HashSet::new()),
        })
    }

    async fn resource_for(&self, key: &str) -> Result<Option<DataResource>> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(None);
                }
                return Err(DtsError::Transfer(format!(
                    "head s3://{}/{key}: {service_error}",
                    self.bucket
                )));
            }
        };

        let name = Path::new(key)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());
        let format = Path::new(key)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        let media_type = head
            .content_type()
            .map(String::from)
            .or_else(|| mime_guess::from_path(key).first().map(|mime| mime.to_string()));
        // The ETag of a simple put is the object's MD5, quoted
        let hash = head
            .e_tag()
            .map(|etag| etag.trim_matches('"').to_string())
            .unwrap_or_default();

        Ok(Some(DataResource {
            id: key.to_string(),
            name,
            path: key.to_string(),
            format,
            media_type,
            bytes: head.content_length().unwrap_or(0).max(0) as u64,
            hash,
            hash_algorithm: Some("md5".to_string()),
            sources: None,
            licenses: None,
            credit: None,
            metadata: None,
        }))
    }
}

#[async_trait]
impl Database for S3Database {
    async fn stage_files(&self, _orcid: &str, _file_ids: &[String]) -> Result<Uuid> {
        let handle = Uuid::new_v4();
        self.staging_handles.lock().await.insert(handle);
        Ok(handle)
    }

    async fn staging_status(&self, handle: Uuid) -> Result<TransferStatusCode> {
        if self.staging_handles.lock().await.contains(&handle) {
            Ok(TransferStatusCode::Succeeded)
        } else {
            Err(DtsError::UnknownTransfer(handle))
        }
    }

    async fn resources(&self, file_ids: &[String]) -> Result<Vec<DataResource>> {
        let mut resources = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            if let Some(resource) = self.resource_for(file_id).await? {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    async fn local_user(&self, _orcid: &str) -> Result<String> {
        Ok(self.local_user.clone())
    }

    async fn search(&self, params: &SearchParameters) -> Result<Vec<DataResource>> {
        let listing = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&params.query)
            .send()
            .await
            .map_err(|e| DtsError::Transfer(format!("list s3://{}: {e}", self.bucket)))?;

        let keys: Vec<String> = listing
            .contents()
            .iter()
            .filter_map(|object| object.key().map(String::from))
            .skip(params.offset)
            .take(params.limit.unwrap_or(usize::MAX))
            .collect();
        self.resources(&keys).await
    }
}
