pub mod globus;
pub mod local;
pub mod s3;

mod tracker;

pub use globus::GlobusEndpoint;
pub use local::LocalEndpoint;
pub use s3::S3Endpoint;

use dts_core::{CredentialConfig, DtsError, Endpoint, EndpointConfig, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Construct the endpoint described by one `endpoints.<name>` configuration
/// section, dispatching on its provider.
pub async fn create_endpoint(
    name: &str,
    config: &EndpointConfig,
    credentials: &HashMap<String, CredentialConfig>,
) -> Result<Arc<dyn Endpoint>> {
    let credential = match &config.credential {
        Some(credential_name) => Some(credentials.get(credential_name).ok_or_else(|| {
            DtsError::Config(format!(
                "endpoint '{name}' refers to unknown credential '{credential_name}'"
            ))
        })?),
        None => None,
    };

    match config.provider.as_str() {
        "local" => {
            let root = config.root.clone().ok_or_else(|| {
                DtsError::Config(format!("local endpoint '{name}' requires a root"))
            })?;
            Ok(Arc::new(LocalEndpoint::new(name, root)?))
        }
        "s3" => Ok(Arc::new(S3Endpoint::new(name, config, credential).await?)),
        "globus" => Ok(Arc::new(GlobusEndpoint::new(name, config, credential)?)),
        other => Err(DtsError::UnknownProvider(other.to_string())),
    }
}
