use crate::task::TransferTask;
use dts_core::{DtsError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Location of the serialized task table under the service data directory
pub fn checkpoint_path(data_dir: &Path) -> PathBuf {
    data_dir.join("dts.msgpack")
}

/// Serialize the whole task table. MessagePack written with named fields is
/// self-describing, so readers tolerate unknown trailing fields and the
/// schema can evolve by field name.
pub async fn save(tasks: &HashMap<Uuid, TransferTask>, path: &Path) -> Result<()> {
    let encoded = rmp_serde::to_vec_named(tasks)
        .map_err(|e| DtsError::Checkpoint(format!("cannot encode task table: {e}")))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, encoded)
        .await
        .map_err(|e| DtsError::Checkpoint(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Load the task table written by a previous run. A missing file or a parse
/// failure yields an empty table; the engine never starts half-loaded.
pub async fn load(path: &Path) -> HashMap<Uuid, TransferTask> {
    let encoded = match tokio::fs::read(path).await {
        Ok(encoded) => encoded,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No checkpoint at {}", path.display());
            return HashMap::new();
        }
        Err(e) => {
            warn!("Cannot read checkpoint {}: {}; starting empty", path.display(), e);
            return HashMap::new();
        }
    };

    match rmp_serde::from_slice::<HashMap<Uuid, TransferTask>>(&encoded) {
        Ok(tasks) => {
            info!(
                "Loaded {} task(s) from checkpoint {}",
                tasks.len(),
                path.display()
            );
            tasks
        }
        Err(e) => {
            warn!(
                "Cannot parse checkpoint {}: {}; starting empty",
                path.display(),
                e
            );
            HashMap::new()
        }
    }
}
