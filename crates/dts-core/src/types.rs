use serde::{Deserialize, Serialize};

/// Progress code for a transfer task or for one of its asynchronous
/// sub-operations (staging, payload transfer, manifest transfer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatusCode {
    #[default]
    Unknown,
    Staging,
    Active,
    Inactive,
    Finalizing,
    Succeeded,
    Failed,
}

impl TransferStatusCode {
    /// A terminal code never changes again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TransferStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Staging => write!(f, "staging"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Observable status of a transfer task or endpoint transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStatus {
    pub code: TransferStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub num_files: usize,
    #[serde(default)]
    pub num_files_transferred: usize,
    #[serde(default)]
    pub num_files_skipped: usize,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: TransferStatusCode::Failed,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Metadata record for a single file, in the Frictionless data-resource
/// shape. The path is interpreted relative to the endpoint root of the
/// database that resolved it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResource {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub bytes: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One file movement requested from an endpoint: source path relative to the
/// source endpoint root, destination path relative to the destination
/// endpoint root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub source_path: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
}

impl FileTransfer {
    pub fn new(source_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            hash: None,
            hash_algorithm: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>, algorithm: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self.hash_algorithm = Some(algorithm.into());
        self
    }
}

/// Parameters for a database file search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParameters {
    pub query: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_codes() {
        assert!(TransferStatusCode::Succeeded.is_terminal());
        assert!(TransferStatusCode::Failed.is_terminal());
        assert!(!TransferStatusCode::Unknown.is_terminal());
        assert!(!TransferStatusCode::Staging.is_terminal());
        assert!(!TransferStatusCode::Active.is_terminal());
        assert!(!TransferStatusCode::Inactive.is_terminal());
        assert!(!TransferStatusCode::Finalizing.is_terminal());
    }

    #[test]
    fn test_status_code_serialization() {
        let json = serde_json::to_string(&TransferStatusCode::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");

        let code: TransferStatusCode = serde_json::from_str("\"staging\"").unwrap();
        assert_eq!(code, TransferStatusCode::Staging);
    }

    #[test]
    fn test_resource_optional_fields_omitted() {
        let resource = DataResource {
            id: "file1.txt".into(),
            name: "file1".into(),
            path: "file1.txt".into(),
            format: None,
            media_type: Some("text/plain".into()),
            bytes: 12,
            hash: "abc123".into(),
            hash_algorithm: Some("sha256".into()),
            sources: None,
            licenses: None,
            credit: None,
            metadata: None,
        };

        let json = serde_json::to_value(&resource).unwrap();
        assert!(json.get("sources").is_none());
        assert!(json.get("format").is_none());
        assert_eq!(json["media_type"], "text/plain");
    }
}
