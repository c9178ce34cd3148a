use anyhow::{Context, Result};
use dts_core::DtsConfig;
use std::path::Path;
use tokio::fs;

pub async fn load_config(path: &Path) -> Result<DtsConfig> {
    let contents = fs::read_to_string(path)
        .await
        .context("Failed to read configuration file")?;

    let config =
        DtsConfig::from_yaml(&contents).context("Failed to parse configuration file")?;

    Ok(config)
}

pub async fn save_config(path: &Path, config: &DtsConfig) -> Result<()> {
    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents =
        serde_yaml::to_string(config).context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}
