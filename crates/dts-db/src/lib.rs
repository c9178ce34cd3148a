pub mod grid;
pub mod local;
pub mod s3;

pub use grid::GridDatabase;
pub use local::LocalDatabase;
pub use s3::S3Database;

use dts_core::{Database, DatabaseConfig, DtsError, Endpoint, Result, UserFederation};
use std::sync::Arc;

/// Construct the database described by one `databases.<name>` configuration
/// section. The driver follows the bound endpoint's provider.
pub fn create_database(
    name: &str,
    config: &DatabaseConfig,
    endpoint: Arc<dyn Endpoint>,
    federation: Option<UserFederation>,
) -> Result<Arc<dyn Database>> {
    match endpoint.provider() {
        "local" => Ok(Arc::new(LocalDatabase::new(config, endpoint, federation))),
        "s3" => Ok(Arc::new(S3Database::new(name, config, endpoint)?)),
        "globus" => Ok(Arc::new(GridDatabase::new(
            name, config, endpoint, federation,
        )?)),
        other => Err(DtsError::UnknownProvider(format!(
            "no database driver for provider '{other}' (database '{name}')"
        ))),
    }
}
