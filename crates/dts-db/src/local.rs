use async_trait::async_trait;
use dts_core::{
    DataResource, Database, DatabaseConfig, DtsError, Endpoint, Result, SearchParameters,
    TransferStatusCode, UserFederation,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A database serving files straight from a local endpoint's directory.
///
/// File ids are root-relative paths. Files are always online, so staging
/// handles complete instantly. Local users come from the ORCID federation
/// when one is configured, else from the configured constant.
pub struct LocalDatabase {
    endpoint: Arc<dyn Endpoint>,
    root: PathBuf,
    federation: Option<UserFederation>,
    fallback_user: String,
    staging_handles: Mutex<HashSet<Uuid>>,
}

impl LocalDatabase {
    pub fn new(
        config: &DatabaseConfig,
        endpoint: Arc<dyn Endpoint>,
        federation: Option<UserFederation>,
    ) -> Self {
        let root = endpoint.root().to_path_buf();
        Self {
            endpoint,
            root,
            federation,
            fallback_user: config.local_user.clone(),
            staging_handles: Mutex::new(HashSet::new()),
        }
    }

    async fn resource_for(&self, file_id: &str) -> Result<Option<DataResource>> {
        let path = self.root.join(file_id);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let contents = tokio::fs::read(&path).await?;
        let hash = hex::encode(Sha256::digest(&contents));

        let name = Path::new(file_id)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let format = Path::new(file_id)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        let media_type = mime_guess::from_path(file_id)
            .first()
            .map(|mime| mime.to_string());

        Ok(Some(DataResource {
            id: file_id.to_string(),
            name,
            path: file_id.to_string(),
            format,
            media_type,
            bytes: metadata.len(),
            hash,
            hash_algorithm: Some("sha256".to_string()),
            sources: None,
            licenses: None,
            credit: None,
            metadata: None,
        }))
    }

    /// Root-relative paths of all regular files under the root
    fn all_file_ids(&self) -> Result<Vec<String>> {
        fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    walk(root, &path, out)?;
                } else if let Ok(relative) = path.strip_prefix(root) {
                    out.push(relative.to_string_lossy().into_owned());
                }
            }
            Ok(())
        }

        let mut ids = Vec::new();
        walk(&self.root, &self.root, &mut ids)?;
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl Database for LocalDatabase {
    async fn stage_files(&self, _orcid: &str, _file_ids: &[String]) -> Result<Uuid> {
        // Files on disk are always online; hand out an instantly-complete
        // handle.
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

    async fn local_user(&self, orcid: &str) -> Result<String> {
        match &self.federation {
            Some(federation) => federation
                .local_user(orcid)
                .await?
                .ok_or_else(|| DtsError::Federation(format!("no local user mapped for {orcid}"))),
            None => Ok(self.fallback_user.clone()),
        }
    }

    async fn search(&self, params: &SearchParameters) -> Result<Vec<DataResource>> {
        let query = params.query.to_lowercase();
        let matching: Vec<String> = self
            .all_file_ids()?
            .into_iter()
            .filter(|id| query.is_empty() || id.to_lowercase().contains(&query))
            .skip(params.offset)
            .take(params.limit.unwrap_or(usize::MAX))
            .collect();
        self.resources(&matching).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dts_endpoints::LocalEndpoint;
    use tempfile::TempDir;

    fn database(dir: &TempDir) -> LocalDatabase {
        let endpoint: Arc<dyn Endpoint> =
            Arc::new(LocalEndpoint::new("test", dir.path().to_path_buf()).unwrap());
        LocalDatabase::new(&DatabaseConfig::default(), endpoint, None)
    }

    #[tokio::test]
    async fn test_resources_resolution() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file1.txt"), b"hello").unwrap();
        let db = database(&dir);

        let resources = db
            .resources(&["file1.txt".to_string(), "missing.txt".to_string()])
            .await
            .unwrap();

        // Unresolvable ids are omitted; the engine compares counts
        assert_eq!(resources.len(), 1);
        let resource = &resources[0];
        assert_eq!(resource.id, "file1.txt");
        assert_eq!(resource.bytes, 5);
        assert_eq!(resource.media_type.as_deref(), Some("text/plain"));
        assert_eq!(resource.hash_algorithm.as_deref(), Some("sha256"));
        assert_eq!(
            resource.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_staging_is_instant() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);

        let handle = db.stage_files("0000-0000-1234-0000", &[]).await.unwrap();
        assert_eq!(
            db.staging_status(handle).await.unwrap(),
            TransferStatusCode::Succeeded
        );
        assert!(db.staging_status(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_user_fallback_constant() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        assert_eq!(db.local_user("0000-0000-1234-0000").await.unwrap(), "dts");
    }

    #[tokio::test]
    async fn test_local_user_through_federation() {
        use std::io::Write;
        let mut users = tempfile::NamedTempFile::new().unwrap();
        users
            .write_all(b"0000-0000-1234-0000,alice\n")
            .unwrap();
        users.flush().unwrap();

        let dir = TempDir::new().unwrap();
        let endpoint: Arc<dyn Endpoint> =
            Arc::new(LocalEndpoint::new("test", dir.path().to_path_buf()).unwrap());
        let federation = UserFederation::spawn(users.path().to_path_buf()).unwrap();
        let db = LocalDatabase::new(&DatabaseConfig::default(), endpoint, Some(federation));

        assert_eq!(
            db.local_user("0000-0000-1234-0000").await.unwrap(),
            "alice"
        );
        assert!(db.local_user("0000-0000-1234-0001").await.is_err());
    }

    #[tokio::test]
    async fn test_search_with_offset_and_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("beta.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("sub/alpha2.txt"), b"c").unwrap();
        let db = database(&dir);

        let all = db
            .search(&SearchParameters {
                query: "alpha".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let paged = db
            .search(&SearchParameters {
                query: "alpha".into(),
                offset: 1,
                limit: Some(5),
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }
}
