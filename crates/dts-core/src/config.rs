use crate::error::{DtsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level DTS configuration, loaded from a YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DtsConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    /// Named credentials referenced by endpoints and the authenticator
    #[serde(default)]
    pub credentials: HashMap<String, CredentialConfig>,

    /// Storage endpoints, keyed by name
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Logical databases, keyed by name
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name of the local endpoint used for manifest staging
    #[serde(default)]
    pub endpoint: String,

    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent HTTP connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Supervisor poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory holding the task checkpoint
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory where manifests are staged before delivery; defaults to the
    /// local endpoint's root when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<PathBuf>,

    /// Retention of completed tasks, in seconds
    #[serde(default = "default_delete_after_s")]
    pub delete_after_s: u64,

    /// Identity provider used to validate access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Accept ORCID-shaped bearer tokens without an identity provider
    #[serde(default)]
    pub debug: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dts")
}

fn default_delete_after_s() -> u64 {
    7 * 24 * 3600
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: default_port(),
            max_connections: default_max_connections(),
            poll_interval_ms: default_poll_interval_ms(),
            data_dir: default_data_dir(),
            manifest_dir: None,
            delete_after_s: default_delete_after_s(),
            auth_url: None,
            debug: false,
        }
    }
}

impl ServiceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delete_after(&self) -> Duration {
        Duration::from_secs(self.delete_after_s)
    }
}

/// A client id/secret pair for an endpoint provider or identity provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub secret: String,
}

/// One configured storage endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Human-readable endpoint name
    #[serde(default)]
    pub name: String,

    /// Provider-assigned endpoint identifier (Globus collection id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<uuid::Uuid>,

    /// Storage provider: "local", "s3" or "globus"
    pub provider: String,

    /// Name of the credential used to authenticate with the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Root directory (local and globus providers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Bucket name (s3 provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Region (s3 provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Provider API base URL (S3-compatible stores, Globus transfer API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One configured logical database, bound to exactly one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Human-readable database name
    #[serde(default)]
    pub name: String,

    /// Organization operating the database
    #[serde(default)]
    pub organization: String,

    /// Public URL of the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Name of the endpoint this database is bound to
    pub endpoint: String,

    /// Two-column ORCID/username CSV enabling user federation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_file: Option<PathBuf>,

    /// Constant local user applied when no federation is configured
    #[serde(default = "default_local_user")]
    pub local_user: String,
}

fn default_local_user() -> String {
    "dts".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            organization: String::new(),
            url: None,
            endpoint: String::new(),
            users_file: None,
            local_user: default_local_user(),
        }
    }
}

impl DtsConfig {
    /// Parse a configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: DtsConfig = serde_yaml::from_str(contents)
            .map_err(|e| DtsError::Config(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references between sections. All of these are fatal at
    /// startup.
    pub fn validate(&self) -> Result<()> {
        if self.service.poll_interval_ms == 0 {
            return Err(DtsError::Config(
                "service.poll_interval_ms must be positive".into(),
            ));
        }

        if self.service.endpoint.is_empty() {
            return Err(DtsError::Config(
                "service.endpoint must name the local endpoint".into(),
            ));
        }
        if !self.endpoints.contains_key(&self.service.endpoint) {
            return Err(DtsError::Config(format!(
                "service.endpoint refers to unknown endpoint '{}'",
                self.service.endpoint
            )));
        }

        for (name, endpoint) in &self.endpoints {
            match endpoint.provider.as_str() {
                "local" | "s3" | "globus" => {}
                other => {
                    return Err(DtsError::Config(format!(
                        "endpoint '{name}' uses unknown provider '{other}'"
                    )));
                }
            }
            if let Some(credential) = &endpoint.credential {
                if !self.credentials.contains_key(credential) {
                    return Err(DtsError::Config(format!(
                        "endpoint '{name}' refers to unknown credential '{credential}'"
                    )));
                }
            }
        }

        for (name, database) in &self.databases {
            if !self.endpoints.contains_key(&database.endpoint) {
                return Err(DtsError::Config(format!(
                    "database '{name}' refers to unknown endpoint '{}'",
                    database.endpoint
                )));
            }
        }

        Ok(())
    }
}
